//! Broadcast fan-out and peer health.
//!
//! Every broadcast round targets the roster as it was when the round started.
//! All peers are attempted in parallel, so a silent peer delays the round by
//! at most the request timeout. Outcomes feed the roster's AWOL state machine.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use ledger_core::protocol::ROUTE_PONG;
use ledger_core::{AwolTransition, Roster};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::{HttpTransport, Payload, TransportError};

/// Roster shared between discovery, broadcasts and the HTTP handlers.
pub type SharedRoster = Arc<Mutex<Roster>>;

/// Invoked with `(peer hostname, response body)` for each 200 response.
pub type ResponseCallback = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Awaited with the hostname of each peer evicted after its grace period.
pub type EvictionHook = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Per-round tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    roster: SharedRoster,
    transport: HttpTransport,
    on_evicted: Option<EvictionHook>,
}

impl Broadcaster {
    pub fn new(roster: SharedRoster, transport: HttpTransport) -> Self {
        Self {
            roster,
            transport,
            on_evicted: None,
        }
    }

    /// Run `hook` whenever a peer is purged from the roster.
    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_evicted = Some(hook);
        self
    }

    pub fn roster(&self) -> &SharedRoster {
        &self.roster
    }

    async fn targets(&self, include_awol: bool) -> Vec<(String, String)> {
        self.roster
            .lock()
            .await
            .peers()
            .filter(|p| include_awol || !p.is_awol())
            .map(|p| (p.hostname.clone(), p.address.clone()))
            .collect()
    }

    /// Send `payload` to `{address}/{route}` on every roster member.
    pub async fn broadcast(
        &self,
        route: &str,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) -> BroadcastSummary {
        let targets = self.targets(true).await;
        self.fan_out(targets, route, payload, callback).await
    }

    /// Like [`broadcast`](Self::broadcast), but AWOL peers are skipped.
    /// Used for incremental messages that a full snapshot will supersede.
    pub async fn post(&self, route: &str, payload: Payload) -> BroadcastSummary {
        let targets = self.targets(false).await;
        self.fan_out(targets, route, payload, None).await
    }

    async fn fan_out(
        &self,
        targets: Vec<(String, String)>,
        route: &str,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) -> BroadcastSummary {
        if targets.is_empty() {
            debug!("No peers to receive /{}", route);
            return BroadcastSummary::default();
        }

        let payload = &payload;
        let sends = targets.into_iter().map(|(hostname, address)| {
            let callback = callback.clone();
            async move {
                let url = format!("{}/{}", address, route);
                let result = self.transport.send(&url, payload).await;
                match result {
                    Ok(delivery) => {
                        if !delivery.is_ok() {
                            warn!("[{}] /{} answered {}", hostname, route, delivery.status);
                            return false;
                        }
                        self.roster.lock().await.record_success(&hostname);
                        if let Some(callback) = callback {
                            tokio::spawn(async move { callback(hostname, delivery.body) });
                        }
                        true
                    }
                    Err(e) => {
                        self.record_failure(&hostname, &e).await;
                        false
                    }
                }
            }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        BroadcastSummary {
            delivered,
            failed: results.len() - delivered,
        }
    }

    /// Sample round-trip latency to every roster member via `/_pong`.
    pub async fn check_members_alive(&self) -> BroadcastSummary {
        let targets = self.targets(true).await;

        let probes = targets.into_iter().map(|(hostname, address)| async move {
            let url = format!("{}/{}", address, ROUTE_PONG);
            match self.transport.send(&url, &Payload::Empty).await {
                Ok(delivery) => {
                    if !delivery.is_ok() {
                        warn!("[{}] /{} answered {}", hostname, ROUTE_PONG, delivery.status);
                        return false;
                    }
                    let mut roster = self.roster.lock().await;
                    roster.record_success(&hostname);
                    let latency_ms = delivery.elapsed.as_secs_f64() * 1000.0;
                    debug!("[LAG] [{}] {:.1}ms", hostname, latency_ms);
                    roster.record_latency(&hostname, latency_ms);
                    true
                }
                Err(e) => {
                    self.record_failure(&hostname, &e).await;
                    false
                }
            }
        });

        let results = join_all(probes).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        BroadcastSummary {
            delivered,
            failed: results.len() - delivered,
        }
    }

    async fn record_failure(&self, hostname: &str, err: &TransportError) {
        if err.is_refused() {
            let transition = self.roster.lock().await.record_refused(hostname, now_ms());
            if transition == AwolTransition::Removed {
                if let Some(hook) = &self.on_evicted {
                    hook(hostname.to_string()).await;
                }
            }
        } else {
            warn!("[{}] {}", hostname, err);
        }
    }
}
