//! Liveness and status endpoints. Served next to the sync loop; handlers only read the status
//! channel, so a slow client can never hold up synchronisation.

use axum::{extract::State, routing::get, Json, Router};
use pricelist_sync_core::SyncStatus;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub fn router(status: watch::Receiver<SyncStatus>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status_handler))
        .with_state(status)
}

async fn health() -> &'static str {
    "ok"
}

async fn status_handler(State(status): State<watch::Receiver<SyncStatus>>) -> Json<SyncStatus> {
    Json(status.borrow().clone())
}

/// Serve until the listener fails or the surrounding task is dropped.
pub async fn serve(listener: TcpListener, status: watch::Receiver<SyncStatus>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Health server listening");
    }
    axum::serve(listener, router(status)).await
}
