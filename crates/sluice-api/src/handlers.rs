//! HTTP handlers.
//!
//! JSON endpoints use the `{ success, data, error }` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::ApiState;

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Stats ──────────────────────────────────────────────────────

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot())
}

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot().pools)
}

/// GET /api/v1/pools/{database}
pub async fn get_pool(
    State(state): State<ApiState>,
    Path(database): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&database) {
        Some(pool) => ApiResponse::ok(pool.snapshot()).into_response(),
        None => error_response(
            &format!("unknown database: {database}"),
            StatusCode::NOT_FOUND,
        )
        .into_response(),
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct Health {
    status: &'static str,
    pools: usize,
    paused: usize,
    clients_active: usize,
    uptime_secs: f64,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    ApiResponse::ok(Health {
        status: "ok",
        pools: snapshot.pools.len(),
        paused: snapshot.pools.iter().filter(|p| p.paused).count(),
        clients_active: snapshot.proxy.clients_active,
        uptime_secs: snapshot.uptime_secs,
    })
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = sluice_metrics::render_prometheus(&state.registry.snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
