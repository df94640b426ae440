//! Server role: the single ingestion point for client reports.
//!
//! Owns the ledger. Every snapshot is applied under one lock so an activity
//! update can never interleave with a snapshot's deregistration sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, head, post},
    Json, Router,
};
use futures::FutureExt;
use ledger_core::{ActivityUpdate, ClientSnapshot, ErrorBody, Ledger, LedgerError, UpdateAccepted};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::{Broadcaster, EvictionHook, SharedRoster};
use crate::routes::{self, CommonState};

/// Shared state for server handlers.
#[derive(Clone)]
pub struct ServerState {
    pub ledger: Arc<Mutex<Ledger>>,
    pub roster: SharedRoster,
    /// Latest idle seconds reported per client hostname
    pub afks: Arc<Mutex<BTreeMap<String, i64>>>,
}

impl ServerState {
    pub fn new(roster: SharedRoster) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::new())),
            roster,
            afks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

/// Error response with a JSON `{error}` body.
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody::new(self.1))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let status = match e {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Forbidden { .. } => StatusCode::FORBIDDEN,
            LedgerError::Conflict { .. } => StatusCode::CONFLICT,
        };
        ApiError(status, e.to_string())
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!("Malformed request body: {}", e);
        ApiError(StatusCode::BAD_REQUEST, e.to_string())
    })
}

/// Server endpoints plus the common ones.
pub fn router(state: ServerState, common: CommonState) -> Router {
    Router::new()
        .route("/_checkout", post(checkout))
        .route("/_update", post(update))
        .route("/_afk/{hostname}/{secs}", head(report_afk))
        .route("/library", get(library))
        .route("/members", get(members))
        .route("/afks", get(afks))
        .with_state(state)
        .merge(routes::common_router(common))
}

async fn checkout(State(state): State<ServerState>, body: Bytes) -> Result<Response, ApiError> {
    let snapshot: ClientSnapshot = decode(&body)?;
    let outcome = state.ledger.lock().await.apply_snapshot(&snapshot);
    Ok(Json(outcome.to_response()).into_response())
}

async fn update(State(state): State<ServerState>, body: Bytes) -> Result<Response, ApiError> {
    let activity: ActivityUpdate = decode(&body)?;
    state.ledger.lock().await.update(&activity)?;
    Ok(Json(UpdateAccepted::new(activity.last)).into_response())
}

async fn report_afk(
    State(state): State<ServerState>,
    Path((hostname, secs)): Path<(String, i64)>,
) -> StatusCode {
    info!("[AFK] [{}] {}s", hostname, secs);
    state.afks.lock().await.insert(hostname, secs);
    StatusCode::OK
}

async fn library(State(state): State<ServerState>) -> Json<Ledger> {
    Json(state.ledger.lock().await.clone())
}

async fn members(State(state): State<ServerState>) -> Json<BTreeMap<String, String>> {
    Json(state.roster.lock().await.members())
}

async fn afks(State(state): State<ServerState>) -> Json<BTreeMap<String, i64>> {
    Json(state.afks.lock().await.clone())
}

/// Release an evicted client's checkouts so its projects stop conflicting.
pub fn purge_on_eviction(state: &ServerState) -> EvictionHook {
    let ledger = state.ledger.clone();
    let afks = state.afks.clone();
    Arc::new(move |host: String| {
        let ledger = ledger.clone();
        let afks = afks.clone();
        async move {
            let released = ledger.lock().await.release_host(&host);
            afks.lock().await.remove(&host);
            info!("[RELEASED] {} dropped {} checkout(s)", host, released.closed.len());
        }
        .boxed()
    })
}

/// Serve the server role until `cancel` fires, sampling client latency on
/// `liveness_interval`.
pub async fn run(
    hostname: &str,
    listener: TcpListener,
    broadcaster: Broadcaster,
    liveness_interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    ensure!(!liveness_interval.is_zero(), "liveness interval must be non-zero");

    let state = ServerState::new(broadcaster.roster().clone());
    let broadcaster = broadcaster.with_eviction_hook(purge_on_eviction(&state));
    let common = CommonState {
        hostname: Arc::from(hostname),
        shutdown: cancel.clone(),
    };

    let liveness_cancel = cancel.clone();
    let liveness = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + liveness_interval;
        let mut ticker = tokio::time::interval_at(start, liveness_interval);
        loop {
            tokio::select! {
                _ = liveness_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    broadcaster.check_members_alive().await;
                }
            }
        }
    });

    info!("[START] Server {}", hostname);
    let served = routes::serve(listener, router(state, common), cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = liveness.await {
        warn!("Liveness task failed: {}", e);
    }
    info!("[STOP] Server {}", hostname);
    served
}
