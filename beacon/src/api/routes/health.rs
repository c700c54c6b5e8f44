//! Health, readiness and liveness routes.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;

use crate::api::models::{LiveResponse, ReadyResponse};
use crate::api::server::AppState;
use crate::metrics::HealthStatus;

/// Full health report; 503 when any check fails.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.service.health().run_all().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

/// Readiness check - is the service ready to accept traffic?
/// Returns HTTP 200 only when healthy and not shutting down.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state
        .service
        .health()
        .check_ready(state.service.is_shutting_down())
        .await;

    let (status, label) = if readiness.ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        status,
        Json(ReadyResponse {
            status: label.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            reason: readiness.reason,
        }),
    )
}

/// Liveness check - is the service alive?
pub async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let shutting_down = state.service.is_shutting_down();
    let (status, label) = if shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "alive")
    };

    (
        status,
        Json(LiveResponse {
            status: label.to_string(),
            uptime: state.service.lifecycle().uptime().as_secs(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}
