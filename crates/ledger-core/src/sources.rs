//! Capability traits for the platform-specific collaborators a client needs.
//!
//! Implementations:
//! - In-memory fakes in this module - for tests and unsupported platforms
//! - `LsofProjects`, `FileWatcher`, `BundleResolver`, `IoregIdleProbe` (in
//!   ledger-daemon) - native adapters

use crate::protocol::{OpenProject, OpenProjects};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Not a project bundle: {0}")]
    NotABundle(String),

    #[error("No project uuid found in {0}")]
    MissingUuid(String),

    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Activity seen inside a project on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub uuid: String,
    /// Unix time (seconds) of the change
    pub at: i64,
}

/// Enumerates the projects currently open on this host.
#[async_trait]
pub trait OpenProjectsSource: Send + Sync {
    /// Full set of open projects, keyed by uuid. An idle editor is `Ok(empty)`.
    async fn open_projects(&self) -> Result<OpenProjects>;
}

/// Filesystem activity, as a lazy infinite stream.
pub trait ActivitySource: Send {
    /// Take the event stream. The stream cannot be restarted: later calls
    /// return an empty stream.
    fn subscribe(&mut self) -> BoxStream<'static, ActivityEvent>;
}

/// Seconds since the last user input, or -1 when it cannot be sampled.
pub trait IdleProbe: Send + Sync {
    fn sample_idle_seconds(&self) -> i64;
}

/// Maps filesystem paths to project bundles and reads their identity.
pub trait ProjectResolver: Send + Sync {
    /// The bundle directory containing `path`, if any.
    fn bundle_root(&self, path: &Path) -> Option<PathBuf>;

    /// Uuid and description of a bundle.
    fn describe(&self, bundle: &Path) -> Result<(String, OpenProject)>;
}

/// Fixed open-project set that tests can swap at will.
#[derive(Default)]
pub struct StaticProjects {
    projects: RwLock<OpenProjects>,
}

impl StaticProjects {
    pub fn new(projects: OpenProjects) -> Self {
        Self {
            projects: RwLock::new(projects),
        }
    }

    pub fn set(&self, projects: OpenProjects) {
        *self.projects.write().unwrap_or_else(|e| e.into_inner()) = projects;
    }
}

#[async_trait]
impl OpenProjectsSource for StaticProjects {
    async fn open_projects(&self) -> Result<OpenProjects> {
        Ok(self
            .projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Activity source fed by hand through a channel.
pub struct ChannelActivity {
    rx: Option<mpsc::UnboundedReceiver<ActivityEvent>>,
}

impl ChannelActivity {
    /// Create the source and the sender that feeds it.
    pub fn new() -> (Self, mpsc::UnboundedSender<ActivityEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { rx: Some(rx) }, tx)
    }
}

impl ActivitySource for ChannelActivity {
    fn subscribe(&mut self) -> BoxStream<'static, ActivityEvent> {
        match self.rx.take() {
            Some(rx) => rx.boxed(),
            None => stream::empty().boxed(),
        }
    }
}

/// Idle probe that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedIdle(pub i64);

impl IdleProbe for FixedIdle {
    fn sample_idle_seconds(&self) -> i64 {
        self.0
    }
}
