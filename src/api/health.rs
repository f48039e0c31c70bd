use crate::api::routes::AppState;
use crate::observability::MetricsRecorder;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

/// GET /health/live - Liveness probe
pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.liveness().await)
}

/// GET /health/ready - every backing store must answer
#[tracing::instrument(skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.readiness().await;
    let code = if status.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// GET /metrics - Prometheus text format
pub async fn metrics() -> Result<String, StatusCode> {
    MetricsRecorder::export().map_err(|e| {
        tracing::error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
