//! Checkout ledger: which host has which project open.
//!
//! The ledger is the single source of truth for project ownership on a
//! server. It records every (project, host) checkout, reports conflicts when
//! more than one host holds the same project, and forgets projects once no
//! host has them open.
//!
//! ```text
//! Ledger[uuid] ─┬─ name
//!               ├─ info
//!               └─ checkouts[hostname] ─┬─ path
//!                                       └─ last
//! ```
//!
//! The ledger itself is not synchronized. Callers wrap it in a single lock and
//! hold that lock for a whole logical operation (see [`Ledger::apply_snapshot`]).

use crate::protocol::{ActivityUpdate, CheckoutResponse, ClientSnapshot, ProjectInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

/// Errors produced by ledger operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Advisory: the checkout was committed, but other hosts hold it too.
    #[error("Project '{name}' ({uuid}) has multiple checkouts: {host}|{}", .others.join("|"))]
    Conflict {
        uuid: String,
        name: String,
        host: String,
        others: Vec<String>,
    },

    #[error("Project does not exist: {0}")]
    NotFound(String),

    #[error("No previous checkout of {uuid} from {host}")]
    Forbidden { uuid: String, host: String },
}

/// One host's checkout of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub path: String,
    /// Unix time (seconds) of the latest activity seen, 0 if none yet
    pub last: i64,
}

impl Checkout {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            last: 0,
        }
    }
}

/// A project known to the ledger.
///
/// Exists only while at least one host has it checked out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub info: ProjectInfo,
    pub checkouts: BTreeMap<String, Checkout>,
}

/// Result of a deregistration sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deregistered {
    /// Uuids whose checkout by the host was dropped
    pub closed: Vec<String>,
    /// Uuids removed entirely because no checkouts remained
    pub removed: Vec<String>,
}

impl Deregistered {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of applying one client snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Uuids checked out without conflict
    pub checkouts: Vec<String>,
    /// Per-uuid conflicts (all committed)
    pub conflicts: Vec<LedgerError>,
    /// Result of the closing sweep
    pub deregistered: Deregistered,
}

impl SnapshotOutcome {
    /// Wire form returned to the client.
    pub fn to_response(&self) -> CheckoutResponse {
        CheckoutResponse {
            checkouts: self.checkouts.clone(),
            closed: self.deregistered.closed.clone(),
            errors: self
                .conflicts
                .iter()
                .filter_map(|e| match e {
                    LedgerError::Conflict { uuid, .. } => Some(uuid.clone()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Project/checkout table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    projects: BTreeMap<String, Project>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a project is known.
    pub fn has_project(&self, uuid: &str) -> bool {
        self.projects.contains_key(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<&Project> {
        self.projects.get(uuid)
    }

    pub fn projects(&self) -> impl Iterator<Item = (&String, &Project)> {
        self.projects.iter()
    }

    /// Number of known projects.
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Record that `host` has `uuid` open at `path`.
    ///
    /// Idempotent. The first checkout creates the project; later calls refresh
    /// `info` and `path` for this host. The name is fixed at creation.
    ///
    /// Returns [`LedgerError::Conflict`] when other hosts also hold the
    /// project. The checkout is committed either way.
    pub fn checkout_project(
        &mut self,
        uuid: &str,
        name: &str,
        host: &str,
        path: &str,
        info: ProjectInfo,
    ) -> Result<(), LedgerError> {
        let Some(project) = self.projects.get_mut(uuid) else {
            let mut checkouts = BTreeMap::new();
            checkouts.insert(host.to_string(), Checkout::new(path));
            self.projects.insert(
                uuid.to_string(),
                Project {
                    name: name.to_string(),
                    info,
                    checkouts,
                },
            );
            info!("[CHECKOUT] [{}] by {}", uuid, host);
            return Ok(());
        };

        project.info = info;
        match project.checkouts.get_mut(host) {
            Some(checkout) => {
                if checkout.path != path {
                    checkout.path = path.to_string();
                }
            }
            None => {
                project
                    .checkouts
                    .insert(host.to_string(), Checkout::new(path));
            }
        }

        let others: Vec<String> = project
            .checkouts
            .keys()
            .filter(|h| h.as_str() != host)
            .cloned()
            .collect();

        if others.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::Conflict {
                uuid: uuid.to_string(),
                name: project.name.clone(),
                host: host.to_string(),
                others,
            })
        }
    }

    /// Apply an activity update.
    ///
    /// The stored time only moves forward; an older `last` is accepted but
    /// leaves the stored value alone.
    pub fn update(&mut self, update: &ActivityUpdate) -> Result<(), LedgerError> {
        let project = self
            .projects
            .get_mut(&update.uuid)
            .ok_or_else(|| LedgerError::NotFound(update.uuid.clone()))?;

        let checkout =
            project
                .checkouts
                .get_mut(&update.hostname)
                .ok_or_else(|| LedgerError::Forbidden {
                    uuid: update.uuid.clone(),
                    host: update.hostname.clone(),
                })?;

        checkout.last = checkout.last.max(update.last);
        Ok(())
    }

    /// Drop every checkout `host` holds on a uuid outside `open`, then delete
    /// projects left without checkouts.
    pub fn deregister_projects(&mut self, host: &str, open: &BTreeSet<String>) -> Deregistered {
        let mut result = Deregistered::default();

        for (uuid, project) in self.projects.iter_mut() {
            if !open.contains(uuid) && project.checkouts.remove(host).is_some() {
                result.closed.push(uuid.clone());
            }
        }

        self.projects.retain(|uuid, project| {
            if project.checkouts.is_empty() {
                result.removed.push(uuid.clone());
                false
            } else {
                true
            }
        });

        result
    }

    /// Reconcile the ledger against one client's full snapshot.
    ///
    /// Checks out every reported project, then sweeps whatever the host no
    /// longer reports. Callers must hold the ledger lock across the whole call
    /// so no update can land between the checkouts and the sweep.
    pub fn apply_snapshot(&mut self, snapshot: &ClientSnapshot) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();
        let host = snapshot.hostname.as_str();

        for (uuid, project) in &snapshot.projects {
            match self.checkout_project(uuid, &project.name, host, &project.path, project.info.clone()) {
                Ok(()) => {
                    info!("[OK] [{}] by {}", uuid, host);
                    outcome.checkouts.push(uuid.clone());
                }
                Err(e) => {
                    warn!("[{}] {}", host, e);
                    outcome.conflicts.push(e);
                }
            }
        }

        let open: BTreeSet<String> = snapshot.projects.keys().cloned().collect();
        outcome.deregistered = self.sweep(host, &open);

        outcome
    }

    /// Release everything `host` holds. Used when the host is evicted.
    pub fn release_host(&mut self, host: &str) -> Deregistered {
        self.sweep(host, &BTreeSet::new())
    }

    fn sweep(&mut self, host: &str, open: &BTreeSet<String>) -> Deregistered {
        let deregistered = self.deregister_projects(host, open);
        for uuid in &deregistered.closed {
            info!("[CLOSED] {} by {}", uuid, host);
        }
        for uuid in &deregistered.removed {
            info!("[REMOVED] {}", uuid);
        }
        deregistered
    }
}
