//! End-to-end tests for ledger-daemon.
//!
//! Real axum servers on loopback, driven over HTTP with reqwest: the server
//! endpoints, broadcast failure handling, latency sampling, and a full client
//! loop reporting to a live server.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use ledger_core::sources::{ChannelActivity, FixedIdle, StaticProjects};
use ledger_core::{
    ActivityEvent, CheckoutResponse, ClientSnapshot, Ledger, OpenProject, OpenProjects, Pong, Roster,
};
use ledger_daemon::client::{self, ClientEvent, ClientRole, ClientSources};
use ledger_daemon::config::Timings;
use ledger_daemon::health::{BroadcastSummary, Broadcaster, SharedRoster};
use ledger_daemon::routes::{self, CommonState};
use ledger_daemon::server::{self, ServerState};
use ledger_daemon::transport::{HttpTransport, Payload};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A server role listening on loopback.
struct TestServer {
    base: String,
    state: ServerState,
    _cancel: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        Self::with_grace(ledger_core::DEFAULT_GRACE_PERIOD).await
    }

    async fn with_grace(grace: Duration) -> Self {
        let cancel = CancellationToken::new();
        let roster: SharedRoster = Arc::new(Mutex::new(Roster::new(grace)));
        let state = ServerState::new(roster);
        let common = CommonState {
            hostname: Arc::from("srv"),
            shutdown: cancel.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(routes::serve(listener, server::router(state.clone(), common), cancel.clone()));

        Self {
            base: format!("http://{}", addr),
            state,
            _cancel: cancel,
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base, route)
    }

    async fn checkout(&self, host: &str, uuids: &[&str]) -> CheckoutResponse {
        let snapshot = ClientSnapshot::new(host, 12140, projects(uuids));
        reqwest::Client::new()
            .post(self.url("_checkout"))
            .json(&snapshot)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn update(&self, host: &str, uuid: &str, last: i64) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url("_update"))
            .json(&json!({"hostname": host, "uuid": uuid, "last": last}))
            .send()
            .await
            .unwrap()
    }

    async fn library(&self) -> Value {
        reqwest::get(self.url("library")).await.unwrap().json().await.unwrap()
    }
}

fn projects(uuids: &[&str]) -> OpenProjects {
    uuids
        .iter()
        .map(|u| (u.to_string(), OpenProject::new("P", "/p1")))
        .collect()
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(2)).unwrap()
}

async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Poll `check` every 50ms for up to 5s.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================================
// Server endpoints
// ============================================================================

#[tokio::test]
async fn test_checkout_conflict_and_deregistration() {
    let server = TestServer::start().await;

    let first = server.checkout("host1", &["u1"]).await;
    assert_eq!(first.checkouts, vec!["u1"]);
    assert!(first.errors.is_empty());

    let second = server.checkout("host2", &["u1"]).await;
    assert_eq!(second.errors, vec!["u1"]);

    let library = server.library().await;
    let checkouts = library["u1"]["checkouts"].as_object().unwrap();
    assert_eq!(checkouts.len(), 2);
    assert_eq!(library["u1"]["name"], "P");
    assert_eq!(checkouts["host1"]["path"], "/p1");

    let closed = server.checkout("host1", &[]).await;
    assert_eq!(closed.closed, vec!["u1"]);
    assert!(server.library().await.get("u1").is_some());

    server.checkout("host2", &[]).await;
    assert_eq!(server.library().await, json!({}));
}

#[tokio::test]
async fn test_update_statuses() {
    let server = TestServer::start().await;

    let resp = server.update("host1", "u1", 100).await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("u1"));

    server.checkout("host1", &["u1"]).await;
    assert_eq!(server.update("host2", "u1", 100).await.status(), 403);

    let resp = server.update("host1", "u1", 100).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": "100"}));

    // Older activity never regresses the stored time
    assert_eq!(server.update("host1", "u1", 50).await.status(), 200);
    assert_eq!(server.library().await["u1"]["checkouts"]["host1"]["last"], 100);
}

#[tokio::test]
async fn test_malformed_bodies_are_rejected() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    for route in ["_checkout", "_update"] {
        let resp = client
            .post(server.url(route))
            .header("content-type", "application/json")
            .body("{ not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{route}");
        let body: Value = resp.json().await.unwrap();
        assert!(body.get("error").is_some());
    }

    let ledger: Ledger = serde_json::from_value(server.library().await).unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_members_and_afks() {
    let server = TestServer::start().await;
    server
        .state
        .roster
        .lock()
        .await
        .upsert("bay1", "http://10.0.0.5:12140");

    let members: Value = reqwest::get(server.url("members")).await.unwrap().json().await.unwrap();
    assert_eq!(members, json!({"bay1": "http://10.0.0.5:12140"}));

    let client = reqwest::Client::new();
    let resp = client.head(server.url("_afk/bay1/300")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.head(server.url("_afk/bay1/not-a-number")).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let afks: Value = reqwest::get(server.url("afks")).await.unwrap().json().await.unwrap();
    assert_eq!(afks, json!({"bay1": 300}));
}

// ============================================================================
// Peer health
// ============================================================================

#[tokio::test]
async fn test_awol_peer_is_evicted_after_grace() {
    let mut roster = Roster::new(Duration::from_millis(50));
    roster.upsert("gone", &closed_address().await);
    let broadcaster = Broadcaster::new(Arc::new(Mutex::new(roster)), transport());

    broadcaster.broadcast("_checkout", Payload::Json(b"{}".to_vec()), None).await;
    assert!(broadcaster.roster().lock().await.get("gone").unwrap().is_awol());

    // Still within grace: unchanged
    broadcaster.broadcast("_checkout", Payload::Json(b"{}".to_vec()), None).await;
    assert!(broadcaster.roster().lock().await.contains("gone"));

    tokio::time::sleep(Duration::from_millis(80)).await;
    broadcaster.broadcast("_checkout", Payload::Json(b"{}".to_vec()), None).await;

    let roster = broadcaster.roster().lock().await;
    assert!(!roster.contains("gone"));
    assert!(roster.awol().is_empty());
}

#[tokio::test]
async fn test_evicted_client_releases_its_checkouts() {
    let server = TestServer::with_grace(Duration::from_millis(50)).await;
    server.checkout("bay1", &["u1"]).await;
    server.checkout("bay2", &["u2"]).await;
    {
        let mut roster = server.state.roster.lock().await;
        roster.upsert("bay1", &closed_address().await);
    }
    server.state.afks.lock().await.insert("bay1".into(), 10);

    let broadcaster = Broadcaster::new(server.state.roster.clone(), transport())
        .with_eviction_hook(ledger_daemon::server::purge_on_eviction(&server.state));

    broadcaster.check_members_alive().await;
    assert!(server.library().await.get("u1").is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    broadcaster.check_members_alive().await;

    let library = server.library().await;
    assert!(library.get("u1").is_none());
    assert!(library.get("u2").is_some());
    let members: Value = reqwest::get(server.url("members")).await.unwrap().json().await.unwrap();
    assert_eq!(members, json!({}));
    assert!(server.state.afks.lock().await.is_empty());

    // u1 is free again
    let response = server.checkout("bay3", &["u1"]).await;
    assert!(response.errors.is_empty());
}

#[tokio::test]
async fn test_latency_includes_peer_delay() {
    const DELAY_MS: u64 = 200;
    const TOLERANCE_MS: f64 = 1500.0;

    let app = Router::new().route(
        "/_pong",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(DELAY_MS)).await;
            Json(Pong::now())
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    let mut roster = Roster::default();
    roster.upsert("slow", &format!("http://{}", addr));
    let broadcaster = Broadcaster::new(Arc::new(Mutex::new(roster)), transport());

    let summary = broadcaster.check_members_alive().await;
    assert_eq!(summary, BroadcastSummary { delivered: 1, failed: 0 });

    let latency = broadcaster.roster().lock().await.get("slow").unwrap().latency_ms.unwrap();
    assert!(latency >= DELAY_MS as f64, "latency {latency}ms shorter than delay");
    assert!(latency <= DELAY_MS as f64 + TOLERANCE_MS, "latency {latency}ms too long");
}

// ============================================================================
// Client to server
// ============================================================================

#[tokio::test]
async fn test_client_role_reports_to_server() {
    let server = TestServer::start().await;
    let mut roster = Roster::default();
    roster.upsert("srv", &server.base);
    let broadcaster = Broadcaster::new(Arc::new(Mutex::new(roster)), transport());
    let mut role = ClientRole::new("bay1", 12140, broadcaster, Arc::new(FixedIdle(-1)));

    role.on_event(ClientEvent::ProjectsPolled(projects(&["u1"])));
    role.flush().await;
    assert_eq!(server.library().await["u1"]["checkouts"]["bay1"]["last"], 0);

    role.on_event(ClientEvent::Activity(ActivityEvent { uuid: "u1".into(), at: 1234 }));
    role.on_event(ClientEvent::AfkTick);
    role.flush().await;

    assert_eq!(server.library().await["u1"]["checkouts"]["bay1"]["last"], 1234);
    assert_eq!(server.state.afks.lock().await["bay1"], -1);

    role.on_event(ClientEvent::ProjectsPolled(OpenProjects::new()));
    role.flush().await;
    assert_eq!(server.library().await, json!({}));
}

#[tokio::test]
async fn test_client_loop_runs_until_shutdown_route() {
    let server = TestServer::start().await;
    let mut roster = Roster::default();
    roster.upsert("srv", &server.base);
    let broadcaster = Broadcaster::new(Arc::new(Mutex::new(roster)), transport());

    let (activity, activity_tx) = ChannelActivity::new();
    let sources = ClientSources {
        projects: Arc::new(StaticProjects::new(projects(&["u1"]))),
        activity: Box::new(activity),
        idle: Arc::new(FixedIdle(-1)),
    };
    let role = ClientRole::new("bay1", 12140, broadcaster, sources.idle.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_base = format!("http://{}", listener.local_addr().unwrap());
    let (_roster_tx, roster_rx) = mpsc::channel(1);
    let timings = Timings {
        projects_interval_secs: 1,
        drain_secs: 1,
        ..Timings::default()
    };
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(async move {
        client::run(role, listener, sources, roster_rx, &timings, cancel).await
    });

    let server = &server;
    assert!(eventually(|| async move { server.library().await.get("u1").is_some() }).await);

    activity_tx
        .unbounded_send(ActivityEvent { uuid: "u1".into(), at: 99 })
        .unwrap();
    assert!(
        eventually(|| async move { server.library().await["u1"]["checkouts"]["bay1"]["last"] == 99 }).await
    );

    let identity: Value = reqwest::get(&client_base).await.unwrap().json().await.unwrap();
    assert_eq!(identity, json!({"ok": "bay1"}));

    let resp = reqwest::get(format!("{}/_shutdown", client_base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    drop(resp);

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}
