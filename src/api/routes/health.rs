//! Liveness, readiness, and metrics endpoints

use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::super::AppState;

static START: OnceLock<Instant> = OnceLock::new();

pub fn mark_start() {
    START.get_or_init(Instant::now);
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
}

/// Liveness: the process is up and serving. Never touches the store.
pub async fn healthz() -> impl IntoResponse {
    let uptime = START.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);
    Json(HealthBody { status: "ok", uptime_seconds: uptime })
}

/// Readiness: the store backend is reachable, and the worker dispatcher's
/// bounded concurrency isn't fully checked out. `degraded` (not hard-down)
/// on saturation, mirroring the original's Celery broker connectivity check.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.store.health_check().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "reason": e.to_string()})),
        )
            .into_response();
    }

    if state.dispatcher.is_saturated() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "reason": "worker dispatch queue saturated"})),
        )
            .into_response();
    }

    (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .backpressure_current_slow_clients
        .set(state.backpressure.current_slow_clients() as f64);

    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
