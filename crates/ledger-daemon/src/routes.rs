//! Endpoints every role answers, and the shared serve loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use ledger_core::Pong;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// State behind the common endpoints.
#[derive(Clone)]
pub struct CommonState {
    pub hostname: Arc<str>,
    pub shutdown: CancellationToken,
}

/// `/_ping` (GET and HEAD), `/_pong` and `/_shutdown`.
pub fn common_router(state: CommonState) -> Router {
    Router::new()
        // GET routes also answer HEAD
        .route("/_ping", get(ping))
        .route("/_pong", get(pong))
        .route("/_shutdown", get(shutdown))
        .with_state(state)
}

async fn ping(State(state): State<CommonState>) -> Json<BTreeMap<String, String>> {
    Json(BTreeMap::from([(state.hostname.to_string(), "pong".to_string())]))
}

async fn pong() -> Json<Pong> {
    Json(Pong::now())
}

async fn shutdown(State(state): State<CommonState>) -> Json<serde_json::Value> {
    info!("[SHUTDOWN] requested over HTTP");
    state.shutdown.cancel();
    Json(serde_json::json!({ "ok": "shutdown" }))
}

/// Serve `router` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("[STOP] HTTP server on {}", addr);
    Ok(())
}
