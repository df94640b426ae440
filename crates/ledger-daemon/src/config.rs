//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::discovery::{CLIENT_SERVICE, SERVER_SERVICE};

/// Which side of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the ledger and ingests client reports
    Server,
    /// Watches local projects and reports them to servers
    Client,
}

impl Role {
    /// mDNS service type this role advertises.
    pub fn service_type(self) -> &'static str {
        match self {
            Role::Server => SERVER_SERVICE,
            Role::Client => CLIENT_SERVICE,
        }
    }

    /// mDNS service type this role browses for.
    pub fn peer_service_type(self) -> &'static str {
        match self {
            Role::Server => CLIENT_SERVICE,
            Role::Client => SERVER_SERVICE,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Role::Server => 14036,
            Role::Client => 12140,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Timers and timeouts. All values are whole seconds unless named otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timings {
    /// Bound on every outbound request (default: 5s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a peer may stay AWOL before eviction (default: 24h)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Open-project enumeration interval (default: 10s)
    #[serde(default = "default_projects_interval")]
    pub projects_interval_secs: u64,

    /// Unconditional snapshot re-broadcast interval (default: 6 min)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Idle-time report interval (default: 15 min)
    #[serde(default = "default_afk_interval")]
    pub afk_interval_secs: u64,

    /// Latency sampling interval (default: 60s)
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Time given to in-flight broadcasts on shutdown (default: 5s)
    #[serde(default = "default_drain")]
    pub drain_secs: u64,

    /// Filesystem watcher debounce in milliseconds (default: 1000)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Timings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn projects_interval(&self) -> Duration {
        Duration::from_secs(self.projects_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn afk_interval(&self) -> Duration {
        Duration::from_secs(self.afk_interval_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Reject periods that cannot drive a timer. Grace and drain may be zero.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("projects_interval_secs", self.projects_interval_secs),
            ("resync_interval_secs", self.resync_interval_secs),
            ("afk_interval_secs", self.afk_interval_secs),
            ("liveness_interval_secs", self.liveness_interval_secs),
            ("debounce_ms", self.debounce_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("timings.{} must be greater than zero", name);
            }
        }
        Ok(())
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            grace_period_secs: default_grace_period(),
            projects_interval_secs: default_projects_interval(),
            resync_interval_secs: default_resync_interval(),
            afk_interval_secs: default_afk_interval(),
            liveness_interval_secs: default_liveness_interval(),
            drain_secs: default_drain(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_request_timeout() -> u64 {
    5
}

fn default_grace_period() -> u64 {
    24 * 3600 // 24 hours
}

fn default_projects_interval() -> u64 {
    10
}

fn default_resync_interval() -> u64 {
    6 * 60
}

fn default_afk_interval() -> u64 {
    15 * 60
}

fn default_liveness_interval() -> u64 {
    60
}

fn default_drain() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    1000
}

/// Main configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timings: Timings,

    /// Directory suffix that marks a project bundle (without the dot)
    #[serde(default = "default_bundle_extension")]
    pub bundle_extension: String,

    /// Path component inside a bundle that marks live editor state. Empty
    /// accepts any path inside the bundle.
    #[serde(default = "default_activity_marker")]
    pub activity_marker: String,

    /// Path fragments that never count as a live bundle (backups, temp copies)
    #[serde(default = "default_excluded_fragments")]
    pub excluded_fragments: Vec<String>,

    /// Process whose open files are enumerated for open projects
    #[serde(default = "default_editor_process")]
    pub editor_process: String,

    /// Roots watched recursively for project activity
    #[serde(default = "default_watch_paths")]
    pub watch_paths: Vec<PathBuf>,
}

fn default_bundle_extension() -> String {
    "fcpbundle".to_string()
}

fn default_activity_marker() -> String {
    "CurrentVersion.fcpevent".to_string()
}

fn default_excluded_fragments() -> Vec<String> {
    vec![
        "/private/".to_string(),
        "Final Cut Backups".to_string(),
        "__Temp".to_string(),
    ]
}

fn default_editor_process() -> String {
    "Final Cut Pro".to_string()
}

fn default_watch_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home);
    }
    paths.push(PathBuf::from("/Volumes"));
    paths
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            bundle_extension: default_bundle_extension(),
            activity_marker: default_activity_marker(),
            excluded_fragments: default_excluded_fragments(),
            editor_process: default_editor_process(),
            watch_paths: default_watch_paths(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::info!("No config file given, using defaults");
            return Ok(Config::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .timings
            .validate()
            .with_context(|| format!("Invalid timings in config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}
