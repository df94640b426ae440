//! Client role: report this host's open projects to every server.
//!
//! One loop consumes timers, roster notifications, polled project sets and
//! filesystem activity. Each reaction spawns its broadcast onto a task
//! tracker and returns immediately, so a slow peer never stalls the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use futures::StreamExt;
use ledger_core::protocol::{ROUTE_AFK, ROUTE_CHECKOUT, ROUTE_UPDATE};
use ledger_core::{
    ActivityEvent, ActivitySource, ActivityUpdate, CheckoutResponse, ClientSnapshot, IdleProbe,
    OpenProjects, OpenProjectsSource,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Timings;
use crate::discovery::RosterChanged;
use crate::health::{Broadcaster, ResponseCallback};
use crate::routes::{self, CommonState};
use crate::transport::Payload;

/// Everything the client loop reacts to.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Fresh result of the open-project enumerator
    ProjectsPolled(OpenProjects),
    /// Something changed inside a project bundle
    Activity(ActivityEvent),
    /// Discovery admitted a peer
    RosterChanged,
    /// Periodic unconditional re-broadcast
    Resync,
    /// Time to report idle seconds
    AfkTick,
    /// Time to sample peer latency
    LivenessTick,
}

/// Platform collaborators the client consumes.
pub struct ClientSources {
    pub projects: Arc<dyn OpenProjectsSource>,
    pub activity: Box<dyn ActivitySource>,
    pub idle: Arc<dyn IdleProbe>,
}

pub struct ClientRole {
    hostname: String,
    port: u16,
    /// Open set as last broadcast
    held: OpenProjects,
    broadcaster: Broadcaster,
    idle: Arc<dyn IdleProbe>,
    tracker: TaskTracker,
}

impl ClientRole {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        broadcaster: Broadcaster,
        idle: Arc<dyn IdleProbe>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            held: OpenProjects::new(),
            broadcaster,
            idle,
            tracker: TaskTracker::new(),
        }
    }

    pub fn held(&self) -> &OpenProjects {
        &self.held
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot::new(self.hostname.clone(), self.port, self.held.clone())
    }

    /// React to one event. Never waits for a broadcast to finish.
    pub fn on_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::ProjectsPolled(projects) => {
                if projects == self.held {
                    return;
                }
                info!(
                    "[PROJECTS] {} open: {:?}",
                    projects.len(),
                    projects.values().map(|p| p.name.as_str()).collect::<Vec<_>>()
                );
                self.held = projects;
                self.dispatch_snapshot();
            }
            ClientEvent::Activity(activity) => {
                if !self.held.contains_key(&activity.uuid) {
                    debug!("Ignoring activity in {} (not open)", activity.uuid);
                    return;
                }
                self.dispatch_update(activity);
            }
            ClientEvent::RosterChanged | ClientEvent::Resync => self.dispatch_snapshot(),
            ClientEvent::AfkTick => self.dispatch_afk(),
            ClientEvent::LivenessTick => {
                let broadcaster = self.broadcaster.clone();
                self.tracker.spawn(async move {
                    broadcaster.check_members_alive().await;
                });
            }
        }
    }

    fn dispatch_snapshot(&self) {
        let payload = match Payload::json(&self.snapshot()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                return;
            }
        };

        let callback: ResponseCallback = Arc::new(|peer, body| {
            match serde_json::from_slice::<CheckoutResponse>(&body) {
                Ok(response) => {
                    for uuid in &response.errors {
                        warn!("[CONFLICT] [{}] {}", peer, uuid);
                    }
                    debug!(
                        "[OK] [{}] {} checked out, {} closed",
                        peer,
                        response.checkouts.len(),
                        response.closed.len()
                    );
                }
                Err(e) => debug!("[{}] unexpected checkout reply: {}", peer, e),
            }
        });

        let broadcaster = self.broadcaster.clone();
        self.tracker.spawn(async move {
            broadcaster
                .broadcast(ROUTE_CHECKOUT, payload, Some(callback))
                .await;
        });
    }

    fn dispatch_update(&self, activity: ActivityEvent) {
        let update = ActivityUpdate {
            hostname: self.hostname.clone(),
            uuid: activity.uuid,
            last: activity.at,
        };
        let payload = match Payload::json(&update) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode update: {}", e);
                return;
            }
        };

        let broadcaster = self.broadcaster.clone();
        self.tracker.spawn(async move {
            broadcaster.post(ROUTE_UPDATE, payload).await;
        });
    }

    fn dispatch_afk(&self) {
        let idle = self.idle.clone();
        let hostname = self.hostname.clone();
        let broadcaster = self.broadcaster.clone();
        self.tracker.spawn(async move {
            let secs = tokio::task::spawn_blocking(move || idle.sample_idle_seconds())
                .await
                .unwrap_or(-1);
            let route = format!("{}/{}/{}", ROUTE_AFK, hostname, secs);
            broadcaster.post(&route, Payload::Head).await;
        });
    }

    /// Wait for every dispatched broadcast so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Give in-flight broadcasts up to `grace` to finish.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("{} broadcast(s) still in flight after {:?}", self.tracker.len(), grace);
        }
    }
}

/// Poll `source` every `period`, forwarding each successful result.
/// Identical consecutive warnings are logged once.
pub async fn poll_open_projects(
    source: Arc<dyn OpenProjectsSource>,
    period: Duration,
    tx: mpsc::Sender<OpenProjects>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_warning: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match source.open_projects().await {
            Ok(projects) => {
                last_warning = None;
                if tx.send(projects).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let message = e.to_string();
                if last_warning.as_deref() != Some(message.as_str()) {
                    warn!("[PROJECTS] {}", message);
                    last_warning = Some(message);
                }
            }
        }
    }
    info!("[STOP] Open-project polling");
}

/// Client endpoints plus the common ones.
pub fn router(common: CommonState) -> Router {
    Router::new()
        .route("/", get(identity))
        .with_state(common.clone())
        .merge(routes::common_router(common))
}

async fn identity(State(state): State<CommonState>) -> Json<BTreeMap<&'static str, String>> {
    Json(BTreeMap::from([("ok", state.hostname.to_string())]))
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run the client role until `cancel` fires.
pub async fn run(
    mut role: ClientRole,
    listener: TcpListener,
    mut sources: ClientSources,
    mut roster_rx: mpsc::Receiver<RosterChanged>,
    timings: &Timings,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    timings.validate()?;

    let common = CommonState {
        hostname: Arc::from(role.hostname.as_str()),
        shutdown: cancel.clone(),
    };
    let server = tokio::spawn(routes::serve(listener, router(common), cancel.clone()));

    let (projects_tx, mut projects_rx) = mpsc::channel(4);
    let poller = tokio::spawn(poll_open_projects(
        sources.projects.clone(),
        timings.projects_interval(),
        projects_tx,
        cancel.clone(),
    ));

    let mut activity = sources.activity.subscribe();
    let mut resync = ticker(timings.resync_interval());
    let mut afk = ticker(timings.afk_interval());
    let mut liveness = ticker(timings.liveness_interval());

    info!("[START] Client {}", role.hostname);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = resync.tick() => ClientEvent::Resync,
            _ = afk.tick() => ClientEvent::AfkTick,
            _ = liveness.tick() => ClientEvent::LivenessTick,
            Some(_) = roster_rx.recv() => ClientEvent::RosterChanged,
            Some(projects) = projects_rx.recv() => ClientEvent::ProjectsPolled(projects),
            Some(change) = activity.next() => ClientEvent::Activity(change),
        };
        role.on_event(event);
    }
    info!("[STOP] Client services");

    role.drain(timings.drain()).await;
    if let Err(e) = poller.await {
        warn!("Polling task failed: {}", e);
    }
    server.await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpTransport;
    use axum::{body::Bytes, http::Method, http::Uri};
    use ledger_core::sources::{FixedIdle, StaticProjects};
    use ledger_core::{OpenProject, Roster};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    type Log = Arc<StdMutex<Vec<(Method, String, Vec<u8>)>>>;

    async fn record(State(log): State<Log>, method: Method, uri: Uri, body: Bytes) -> &'static str {
        log.lock().unwrap().push((method, uri.path().to_string(), body.to_vec()));
        "{}"
    }

    /// A client role whose only peer records every request it receives.
    async fn role_with_recorder() -> (ClientRole, Log) {
        let log: Log = Arc::default();
        let app = Router::new().fallback(record).with_state(log.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut roster = Roster::default();
        roster.upsert("srv", &format!("http://{}", addr));
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let broadcaster = Broadcaster::new(Arc::new(Mutex::new(roster)), transport);

        let role = ClientRole::new("bay1", 12140, broadcaster, Arc::new(FixedIdle(42)));
        (role, log)
    }

    fn projects(uuids: &[&str]) -> OpenProjects {
        uuids
            .iter()
            .map(|u| (u.to_string(), OpenProject::new(format!("{}.fcpbundle", u), format!("/p/{}", u))))
            .collect()
    }

    fn paths(log: &Log) -> Vec<String> {
        log.lock().unwrap().iter().map(|(_, p, _)| p.clone()).collect()
    }

    #[tokio::test]
    async fn test_changed_projects_broadcast_snapshot() {
        let (mut role, log) = role_with_recorder().await;

        role.on_event(ClientEvent::ProjectsPolled(projects(&["u1"])));
        role.flush().await;

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        let (method, path, body) = &entries[0];
        assert_eq!(method, Method::POST);
        assert_eq!(path, "/_checkout");
        let snapshot: ClientSnapshot = serde_json::from_slice(body).unwrap();
        assert_eq!(snapshot.hostname, "bay1");
        assert_eq!(snapshot.port, 12140);
        assert!(snapshot.projects.contains_key("u1"));
    }

    #[tokio::test]
    async fn test_unchanged_projects_are_not_rebroadcast() {
        let (mut role, log) = role_with_recorder().await;

        role.on_event(ClientEvent::ProjectsPolled(projects(&["u1"])));
        role.on_event(ClientEvent::ProjectsPolled(projects(&["u1"])));
        role.flush().await;

        assert_eq!(paths(&log), vec!["/_checkout"]);
    }

    #[tokio::test]
    async fn test_resync_and_roster_change_always_broadcast() {
        let (mut role, log) = role_with_recorder().await;

        role.on_event(ClientEvent::Resync);
        role.on_event(ClientEvent::RosterChanged);
        role.flush().await;

        assert_eq!(paths(&log), vec!["/_checkout", "/_checkout"]);
    }

    #[tokio::test]
    async fn test_activity_only_for_held_projects() {
        let (mut role, log) = role_with_recorder().await;
        role.on_event(ClientEvent::ProjectsPolled(projects(&["u1"])));
        role.flush().await;
        log.lock().unwrap().clear();

        role.on_event(ClientEvent::Activity(ActivityEvent { uuid: "u2".into(), at: 5 }));
        role.on_event(ClientEvent::Activity(ActivityEvent { uuid: "u1".into(), at: 7 }));
        role.flush().await;

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, "/_update");
        let update: ActivityUpdate = serde_json::from_slice(&entries[0].2).unwrap();
        assert_eq!(update.uuid, "u1");
        assert_eq!(update.hostname, "bay1");
        assert_eq!(update.last, 7);
    }

    #[tokio::test]
    async fn test_afk_reports_idle_seconds_with_head() {
        let (mut role, log) = role_with_recorder().await;

        role.on_event(ClientEvent::AfkTick);
        role.flush().await;

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Method::HEAD);
        assert_eq!(entries[0].1, "/_afk/bay1/42");
    }

    #[tokio::test]
    async fn test_poller_forwards_projects_until_cancelled() {
        let source = Arc::new(StaticProjects::new(projects(&["u1"])));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_open_projects(
            source,
            Duration::from_millis(10),
            tx,
            cancel.clone(),
        ));

        let first = rx.recv().await.unwrap();
        assert!(first.contains_key("u1"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_is_an_error_not_a_panic() {
        let (role, _log) = role_with_recorder().await;
        let sources = ClientSources {
            projects: Arc::new(StaticProjects::new(OpenProjects::new())),
            activity: Box::new(ledger_core::sources::ChannelActivity::new().0),
            idle: Arc::new(FixedIdle(-1)),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_roster_tx, roster_rx) = mpsc::channel(1);
        let timings = Timings {
            resync_interval_secs: 0,
            ..Timings::default()
        };

        let result = run(role, listener, sources, roster_rx, &timings, CancellationToken::new()).await;

        assert!(result.is_err());
    }
}
