//! Wire types exchanged between client and server roles.
//!
//! All bodies are JSON. Field names match what peers already speak on the
//! network, so renames here are protocol changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Route for full open-project snapshots (client → server).
pub const ROUTE_CHECKOUT: &str = "_checkout";
/// Route for per-project activity updates (client → server).
pub const ROUTE_UPDATE: &str = "_update";
/// Reachability probe answered by both roles.
pub const ROUTE_PING: &str = "_ping";
/// Timestamp probe used for latency sampling.
pub const ROUTE_PONG: &str = "_pong";
/// Idle-time reports (client → server), followed by `/{hostname}/{seconds}`.
pub const ROUTE_AFK: &str = "_afk";

/// Extra key/value metadata attached to a project.
pub type ProjectInfo = BTreeMap<String, String>;

/// A project a client currently has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenProject {
    /// Display name (usually the bundle's file name)
    pub name: String,
    /// Absolute path of the bundle on the client
    pub path: String,
    /// Opaque metadata, stored as-is by the server
    #[serde(default)]
    pub info: ProjectInfo,
}

impl OpenProject {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            info: ProjectInfo::new(),
        }
    }
}

/// The full set of projects open on one host, keyed by uuid.
pub type OpenProjects = BTreeMap<String, OpenProject>;

/// A client's complete report of its open projects.
///
/// Applied atomically by the server: every listed uuid is checked out for
/// `hostname`, and anything the host held before but no longer lists is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub projects: OpenProjects,
}

impl ClientSnapshot {
    pub fn new(hostname: impl Into<String>, port: u16, projects: OpenProjects) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            projects,
        }
    }
}

/// Activity observed inside an open project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub hostname: String,
    pub uuid: String,
    /// Unix time (seconds) of the activity
    pub last: i64,
}

/// Server reply to a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    /// Uuids checked out without conflict
    pub checkouts: Vec<String>,
    /// Uuids this host no longer has open
    pub closed: Vec<String>,
    /// Uuids that are also checked out by another host
    pub errors: Vec<String>,
}

/// Server reply to an accepted activity update. `ok` carries the reported
/// time as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccepted {
    pub ok: String,
}

impl UpdateAccepted {
    pub fn new(last: i64) -> Self {
        Self { ok: last.to_string() }
    }
}

/// Error body returned with any non-200 status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl ToString) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// Body of `/_pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub t: DateTime<Utc>,
}

impl Pong {
    pub fn now() -> Self {
        Self { t: Utc::now() }
    }
}
