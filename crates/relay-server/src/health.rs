//! `/health` and `/metrics` endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{Envelope, QueueSender};
use serde::Serialize;
use tokio::sync::watch;

use crate::gateway::SessionRegistry;
use crate::lifecycle::LifecycleState;
use crate::metrics;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while running, `"unavailable"` otherwise.
    pub status: String,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Seconds since the relay was created.
    pub uptime_secs: u64,
    /// Live session count.
    pub sessions: usize,
    /// Envelopes waiting for the processing worker.
    pub inbound_depth: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    state: LifecycleState,
    sessions: usize,
    inbound_depth: usize,
) -> HealthResponse {
    let status = if state == LifecycleState::Running {
        "ok"
    } else {
        "unavailable"
    };
    HealthResponse {
        status: status.into(),
        state,
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        inbound_depth,
    }
}

/// Shared state for the status routes.
#[derive(Clone)]
pub struct StatusState {
    /// When the relay was created.
    pub start_time: Instant,
    /// Lifecycle state feed.
    pub lifecycle: watch::Receiver<LifecycleState>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Inbound queue producer, used only for its depth.
    pub inbound: QueueSender<Envelope>,
    /// Prometheus handle; `/metrics` returns 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

/// Router serving `GET /health` and `GET /metrics`.
pub fn status_routes(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health. Returns 503 unless the relay is running.
async fn health_handler(State(state): State<StatusState>) -> (StatusCode, Json<HealthResponse>) {
    let lifecycle = *state.lifecycle.borrow();
    let resp = health_check(
        state.start_time,
        lifecycle,
        state.registry.len(),
        state.inbound.depth(),
    );
    let code = if lifecycle == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<StatusState>) -> Response {
    match state.metrics {
        Some(handle) => metrics::render(&handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
