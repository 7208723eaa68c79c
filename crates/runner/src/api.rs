//! HTTP API for run status, aborts, health checks and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use ramp_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::RampMetrics,
    AbortHandle, RunStatusHandle,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: RampMetrics,
    pub status: RunStatusHandle,
    pub abort: AbortHandle,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: RampMetrics,
        status: RunStatusHandle,
        abort: AbortHandle,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            status,
            abort,
        }
    }
}

/// Body of an abort response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortResponse {
    pub accepted: bool,
    pub message: String,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - ready while a run is in progress
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Latest published run state
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status.snapshot())
}

/// Ask the run to stop before its next level
async fn abort(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.status.snapshot();
    if snapshot.is_terminated() {
        return (
            StatusCode::CONFLICT,
            Json(AbortResponse {
                accepted: false,
                message: "Run already terminated".to_string(),
            }),
        );
    }

    let already = state.abort.is_aborted();
    state.abort.abort();
    if !already {
        info!(current_qps = snapshot.current_qps, "Abort requested over API");
    }

    (
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            accepted: true,
            message: if already {
                "Abort already pending".to_string()
            } else {
                format!("Run will stop before the level after {} QPS", snapshot.current_qps)
            },
        }),
    )
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/abort", post(abort))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
