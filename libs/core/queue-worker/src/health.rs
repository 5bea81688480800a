//! Health check handlers for worker services.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), backed by the transport health check
//! - Worker statuses (`/workers`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::manager::Manager;
use crate::metrics;
use crate::worker::{WorkerPhase, WorkerStatus};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub manager: Arc<Manager>,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        manager: Arc<Manager>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" if responding.
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready when the transport answers and no worker has failed.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let transport = state.manager.transport();
    let failed: Vec<String> = state
        .manager
        .statuses()
        .into_iter()
        .filter(|s| matches!(s.phase, WorkerPhase::Error(_)))
        .map(|s| format!("{}:{}", s.name, s.index))
        .collect();

    let transport_check = match transport.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let body = json!({
        "status": if transport_check == "ok" && failed.is_empty() { "ready" } else { "not_ready" },
        "checks": {
            (transport.name()): transport_check,
            "failed_workers": failed,
        }
    });

    if transport_check == "ok" && failed.is_empty() {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Worker status handler.
pub async fn workers_handler(State(state): State<HealthState>) -> Json<Vec<WorkerStatus>> {
    Json(state.manager.statuses())
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the standard health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/workers", get(workers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
