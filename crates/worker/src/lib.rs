//! Worker process surface: the health endpoints served next to the scheduler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use chorus_infra::health::HealthProbe;

/// `/livez` answers as long as the process runs; `/readyz` reflects the probe.
pub fn health_router(probe: Arc<dyn HealthProbe>) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(probe)
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(probe): State<Arc<dyn HealthProbe>>) -> impl IntoResponse {
    let readiness = probe.readiness().await;
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        tracing::warn!(checks = ?readiness.checks, "not ready");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
