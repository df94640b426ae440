//! Filesystem activity inside project bundles.
//!
//! Uses notify-debouncer-mini over every watch root. Each debounced batch
//! yields at most one event per bundle, stamped with the batch time.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use ledger_core::{ActivityEvent, ActivitySource, ProjectResolver};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};

/// Bundle root → uuid, so Settings.plist is read once per bundle
type UuidCache = Arc<Mutex<HashMap<PathBuf, String>>>;

/// Watches bundle activity under a set of roots.
pub struct FileWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Taken by the first `subscribe`
    event_rx: Option<mpsc::UnboundedReceiver<ActivityEvent>>,
    roots: Vec<PathBuf>,
}

impl FileWatcher {
    /// Start watching `roots` recursively. Roots that don't exist are skipped.
    pub fn new(
        roots: &[PathBuf],
        resolver: Arc<dyn ProjectResolver>,
        debounce: Duration,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cache: UuidCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let now = chrono::Utc::now().timestamp();
                    let paths = events.iter().map(|e| e.path.as_path());
                    for event in activity_for_batch(paths, resolver.as_ref(), &cache, now) {
                        if event_tx.send(event).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.exists() {
                warn!("Not watching {:?}: does not exist", root);
                continue;
            }
            // FSEvents wants the real path (/var → /private/var on macOS)
            let root = root.canonicalize().unwrap_or_else(|_| root.clone());
            match debouncer.watcher().watch(&root, RecursiveMode::Recursive) {
                Ok(()) => {
                    debug!("Watching {:?}", root);
                    watched.push(root);
                }
                Err(e) => warn!("Failed to watch {:?}: {}", root, e),
            }
        }

        Ok(Self {
            _debouncer: debouncer,
            event_rx: Some(event_rx),
            roots: watched,
        })
    }

    /// Roots actually being watched.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl ActivitySource for FileWatcher {
    fn subscribe(&mut self) -> BoxStream<'static, ActivityEvent> {
        match self.event_rx.take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

/// One event per distinct bundle touched by `paths`.
fn activity_for_batch<'a>(
    paths: impl IntoIterator<Item = &'a Path>,
    resolver: &dyn ProjectResolver,
    cache: &UuidCache,
    now: i64,
) -> Vec<ActivityEvent> {
    let bundles: BTreeSet<PathBuf> = paths
        .into_iter()
        .filter_map(|p| resolver.bundle_root(p))
        .collect();

    let mut uuids = BTreeSet::new();
    for bundle in bundles {
        let cached = cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bundle)
            .cloned();

        let uuid = match cached {
            Some(uuid) => uuid,
            None => match resolver.describe(&bundle) {
                Ok((uuid, _)) => {
                    cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(bundle.clone(), uuid.clone());
                    uuid
                }
                Err(e) => {
                    warn!("[UPDATE] {}", e);
                    continue;
                }
            },
        };
        uuids.insert(uuid);
    }

    uuids
        .into_iter()
        .map(|uuid| {
            debug!("Activity in {}", uuid);
            ActivityEvent { uuid, at: now }
        })
        .collect()
}
