//! sluice-api — HTTP surface for Sluice.
//!
//! Read-only: every handler works from one [`StatsSnapshot`] taken from the
//! shared [`PoolRegistry`]. Pool control stays on the admin console.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/api/v1/stats` | Full stats snapshot |
//! | GET | `/api/v1/pools` | One entry per pool |
//! | GET | `/api/v1/pools/{database}` | A single pool |
//! | GET | `/healthz` | Liveness and pool count |
//!
//! [`StatsSnapshot`]: sluice_metrics::StatsSnapshot

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use sluice_pool::PoolRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<PoolRegistry>,
}

/// Build the complete HTTP router.
pub fn build_router(registry: Arc<PoolRegistry>) -> Router {
    let state = ApiState { registry };

    let api_routes = Router::new()
        .route("/stats", get(handlers::stats))
        .route("/pools", get(handlers::list_pools))
        .route("/pools/{database}", get(handlers::get_pool))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "metrics endpoint listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
