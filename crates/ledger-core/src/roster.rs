//! Roster of reachable peers and their AWOL state.
//!
//! The roster tracks every peer of the complementary role that discovery has
//! validated, plus the failure-detection state used by broadcasts:
//!
//! ```text
//! ALIVE --(refused)--> AWOL(marked_at = now)
//! AWOL  --(refused, now - marked_at >= grace)--> REMOVED
//! AWOL  --(any success)--> ALIVE
//! ```
//!
//! Only "connection refused / unreachable" counts as a failure here. Other
//! transport errors are the caller's to log and ignore.
//!
//! Time is passed in explicitly (milliseconds since epoch) so the state
//! machine can be driven deterministically in tests.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Default time a peer may stay AWOL before it is evicted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// A known peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    /// Advertised instance name
    pub hostname: String,
    /// Base URL that answered the reachability probe, e.g. `http://10.0.0.4:14036`
    pub address: String,
    /// When the peer was first marked AWOL (ms since epoch), `None` while alive
    pub awol_since: Option<u64>,
    /// Most recent round-trip sample in milliseconds
    pub latency_ms: Option<f64>,
}

impl Peer {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            awol_since: None,
            latency_ms: None,
        }
    }

    pub fn is_awol(&self) -> bool {
        self.awol_since.is_some()
    }
}

/// State change caused by a contact attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwolTransition {
    /// Nothing changed (or the peer is unknown)
    Unchanged,
    /// Peer was alive and is now AWOL
    MarkedAwol,
    /// Peer was AWOL and answered again
    Recovered,
    /// Peer stayed AWOL past the grace period and was purged
    Removed,
}

/// Peers of the complementary role, indexed by hostname.
#[derive(Debug, Clone)]
pub struct Roster {
    peers: BTreeMap<String, Peer>,
    grace_period: Duration,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Roster {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            grace_period,
        }
    }

    /// Insert or refresh a validated peer.
    ///
    /// A validated peer just answered a probe, so any AWOL mark is cleared.
    /// Returns true if the peer is new or its address changed.
    pub fn upsert(&mut self, hostname: &str, address: &str) -> bool {
        match self.peers.get_mut(hostname) {
            Some(peer) => {
                peer.awol_since = None;
                if peer.address != address {
                    peer.address = address.to_string();
                    true
                } else {
                    false
                }
            }
            None => {
                self.peers
                    .insert(hostname.to_string(), Peer::new(hostname, address));
                true
            }
        }
    }

    pub fn remove(&mut self, hostname: &str) -> Option<Peer> {
        self.peers.remove(hostname)
    }

    pub fn get(&self, hostname: &str) -> Option<&Peer> {
        self.peers.get(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.peers.contains_key(hostname)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Hostname → base URL for every peer, AWOL or not.
    pub fn members(&self) -> BTreeMap<String, String> {
        self.peers
            .values()
            .map(|p| (p.hostname.clone(), p.address.clone()))
            .collect()
    }

    /// Hostnames currently marked AWOL.
    pub fn awol(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.is_awol())
            .map(|p| p.hostname.clone())
            .collect()
    }

    /// Record a successful contact.
    pub fn record_success(&mut self, hostname: &str) -> AwolTransition {
        let Some(peer) = self.peers.get_mut(hostname) else {
            return AwolTransition::Unchanged;
        };

        if peer.awol_since.take().is_some() {
            info!("[BACK] [{}] {}", hostname, peer.address);
            AwolTransition::Recovered
        } else {
            AwolTransition::Unchanged
        }
    }

    /// Record a refused/unreachable contact at `now_ms`.
    pub fn record_refused(&mut self, hostname: &str, now_ms: u64) -> AwolTransition {
        let grace_ms = self.grace_period.as_millis() as u64;

        let Some(peer) = self.peers.get_mut(hostname) else {
            return AwolTransition::Unchanged;
        };

        let awol_since = peer.awol_since;
        match awol_since {
            None => {
                peer.awol_since = Some(now_ms);
                warn!("[AWOL] [{}] {}", hostname, peer.address);
                AwolTransition::MarkedAwol
            }
            Some(marked_at) if now_ms.saturating_sub(marked_at) >= grace_ms => {
                if let Some(peer) = self.peers.remove(hostname) {
                    warn!("[EVICTED] [{}] {}", hostname, peer.address);
                }
                AwolTransition::Removed
            }
            Some(_) => AwolTransition::Unchanged,
        }
    }

    /// Overwrite the latency sample for a peer.
    pub fn record_latency(&mut self, hostname: &str, latency_ms: f64) {
        if let Some(peer) = self.peers.get_mut(hostname) {
            peer.latency_ms = Some(latency_ms);
        }
    }

    /// Hostname → last latency sample (ms) for peers that have one.
    pub fn latencies(&self) -> BTreeMap<String, f64> {
        self.peers
            .values()
            .filter_map(|p| p.latency_ms.map(|l| (p.hostname.clone(), l)))
            .collect()
    }
}
