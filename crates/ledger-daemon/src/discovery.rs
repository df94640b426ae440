//! mDNS membership: advertise this instance and keep a roster of the
//! complementary role.
//!
//! Discovered services are only admitted after one of their addresses answers
//! a `/_ping` probe. Admissions are announced on a buffered channel so the
//! consumer never slows down discovery.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use futures::stream::{self, BoxStream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::health::SharedRoster;
use crate::transport::HttpTransport;

/// Service type advertised by clients and browsed by servers.
pub const CLIENT_SERVICE: &str = "_ledgerclient._tcp.local.";
/// Service type advertised by servers and browsed by clients.
pub const SERVER_SERVICE: &str = "_ledgerserver._tcp.local.";

/// Pending roster notifications before new ones are dropped.
const NOTIFY_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// Roster contents right after an admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterChanged(pub BTreeMap<String, String>);

/// A resolved service instance, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Instance name, which is the peer's hostname
    pub name: String,
    pub addresses: Vec<Ipv4Addr>,
    pub port: u16,
    pub version: Option<String>,
}

impl DiscoveredService {
    /// Candidate base URLs, one per address.
    pub fn base_urls(&self) -> Vec<String> {
        self.addresses
            .iter()
            .map(|ip| format!("http://{}:{}", ip, self.port))
            .collect()
    }
}

/// Instance label of a full service name (`host._type._tcp.local.` → `host`).
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or(fullname))
        .to_string()
}

/// Parse and sort the IPv4 candidates. IPv6 is not probed.
fn ipv4_candidates<I, T>(addresses: I) -> Vec<Ipv4Addr>
where
    I: IntoIterator<Item = T>,
    T: ToString,
{
    let mut ips: Vec<Ipv4Addr> = addresses
        .into_iter()
        .filter_map(|a| a.to_string().parse().ok())
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

/// Probes discovered services and admits the reachable ones.
#[derive(Clone)]
pub struct MemberValidator {
    roster: SharedRoster,
    transport: HttpTransport,
    notify_tx: mpsc::Sender<RosterChanged>,
}

impl MemberValidator {
    pub fn new(
        roster: SharedRoster,
        transport: HttpTransport,
    ) -> (Self, mpsc::Receiver<RosterChanged>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        (
            Self {
                roster,
                transport,
                notify_tx,
            },
            notify_rx,
        )
    }

    /// Probe each candidate address in turn; the first that answers becomes
    /// the peer's address. Returns whether the service was admitted.
    pub async fn admit(&self, service: &DiscoveredService) -> bool {
        for base in service.base_urls() {
            if !self.transport.probe(&base).await {
                continue;
            }

            let members = {
                let mut roster = self.roster.lock().await;
                roster.upsert(&service.name, &base);
                roster.members()
            };
            info!(
                "[MEMBER] [{}] {} (version {})",
                service.name,
                base,
                service.version.as_deref().unwrap_or("unknown")
            );

            if let Err(e) = self.notify_tx.try_send(RosterChanged(members)) {
                debug!("Roster notification dropped: {}", e);
            }
            return true;
        }

        warn!(
            "[UNREACHABLE] [{}] none of {:?} answered on port {}",
            service.name, service.addresses, service.port
        );
        false
    }
}

/// Advertisement plus browsing on one mDNS daemon.
pub struct Membership {
    daemon: ServiceDaemon,
    validator: MemberValidator,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Membership {
    pub fn new(
        roster: SharedRoster,
        transport: HttpTransport,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RosterChanged>), DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let (validator, notify_rx) = MemberValidator::new(roster, transport);
        Ok((
            Self {
                daemon,
                validator,
                cancel,
                tasks: TaskTracker::new(),
            },
            notify_rx,
        ))
    }

    /// Advertise `hostname` under `service_type` until cancelled, then
    /// unregister.
    pub fn register(
        &self,
        service_type: &str,
        hostname: &str,
        port: u16,
        metadata: &[(&str, &str)],
    ) -> Result<(), DiscoveryError> {
        let host = format!("{}.local.", hostname);
        let service = ServiceInfo::new(service_type, hostname, &host, "", port, metadata)?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        self.daemon.register(service)?;
        info!("Advertising {} on port {}", fullname, port);

        let daemon = self.daemon.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            cancel.cancelled().await;
            match daemon.unregister(&fullname) {
                Ok(_) => info!("Unregistered {}", fullname),
                Err(e) => error!("Failed to unregister {}: {}", fullname, e),
            }
        });
        Ok(())
    }

    /// Resolved instances of `service_type`, until cancelled.
    pub fn browse(
        &self,
        service_type: &str,
    ) -> Result<BoxStream<'static, DiscoveredService>, DiscoveryError> {
        let receiver = self.daemon.browse(service_type)?;
        let state = (receiver, self.cancel.clone(), service_type.to_string());

        let events = stream::unfold(state, |(receiver, cancel, ty)| async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    event = receiver.recv_async() => event,
                };

                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let service = DiscoveredService {
                            name: instance_name(info.get_fullname(), &ty),
                            addresses: ipv4_candidates(info.get_addresses().iter()),
                            port: info.get_port(),
                            version: info.get_property_val_str("version").map(str::to_string),
                        };
                        return Some((service, (receiver, cancel, ty)));
                    }
                    Ok(other) => debug!("mDNS: {:?}", other),
                    Err(e) => {
                        warn!("mDNS browse ended: {}", e);
                        return None;
                    }
                }
            }
        });

        Ok(events.boxed())
    }

    /// Advertise as `advertise` and admit every reachable `browse` instance.
    pub fn start(
        &self,
        advertise: &str,
        browse: &str,
        hostname: &str,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        let version = env!("CARGO_PKG_VERSION");
        self.register(advertise, hostname, port, &[("version", version)])?;

        let mut services = self.browse(browse)?;
        let validator = self.validator.clone();
        let tasks = self.tasks.clone();
        let browse_type = browse.to_string();
        self.tasks.spawn(async move {
            info!("Browsing for {}", browse_type);
            while let Some(service) = services.next().await {
                let validator = validator.clone();
                tasks.spawn(async move { validator.admit(&service).await });
            }
            debug!("Stopped browsing for {}", browse_type);
        });
        Ok(())
    }

    /// Cancel advertisement and browsing, wait for both, then stop the daemon.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS daemon shutdown failed: {}", e);
        }
        info!("[STOP] Membership");
    }
}
