//! Read-only management endpoint
//!
//! - `GET /api/tunnel`: configured tunnels
//! - `GET /health`: liveness

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use backhaul_proto::Tunnel;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    tunnels: Arc<Vec<Tunnel>>,
}

impl ApiState {
    pub fn new(tunnels: Vec<Tunnel>) -> Self {
        Self {
            tunnels: Arc::new(tunnels),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn list_tunnels(State(state): State<ApiState>) -> Json<Vec<Tunnel>> {
    Json(state.tunnels.as_ref().clone())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/tunnel", get(list_tunnels))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the management endpoint on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Management API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
