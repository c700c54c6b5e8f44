//! API route modules.
//!
//! Every endpoint sits under the configured base path and can be switched
//! off individually; disabled endpoints fall through to the 404 handler.

pub mod health;
pub mod info;
pub mod metrics;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{MethodRouter, get},
};

use crate::api::models::NotFoundResponse;
use crate::api::server::{AppState, EndpointToggles};

/// Endpoint paths relative to the base path, paired with their handlers.
fn endpoints(toggles: &EndpointToggles) -> Vec<(&'static str, MethodRouter<AppState>)> {
    let all = [
        (toggles.metrics, "/metrics", get(metrics::scrape)),
        (toggles.summary, "/metrics/summary", get(metrics::summary)),
        (toggles.health, "/health", get(health::health_check)),
        (toggles.ready, "/ready", get(health::readiness_check)),
        (toggles.live, "/live", get(health::liveness_check)),
        (toggles.info, "/info", get(info::info)),
        (toggles.debug, "/debug", get(info::debug)),
        (
            toggles.debug,
            "/debug/log-filter",
            get(info::log_filter).put(info::update_log_filter),
        ),
    ];

    all.into_iter()
        .filter(|(enabled, _, _)| *enabled)
        .map(|(_, path, handler)| (path, handler))
        .collect()
}

/// Full paths of the enabled endpoints.
pub fn available_paths(base_path: &str, toggles: &EndpointToggles) -> Vec<String> {
    endpoints(toggles)
        .into_iter()
        .map(|(path, _)| format!("{}{}", base_path, path))
        .collect()
}

/// Create the router with every enabled endpoint.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new();
    for (path, handler) in endpoints(&state.endpoints) {
        router = router.route(&format!("{}{}", state.base_path, path), handler);
    }

    router.fallback(not_found).with_state(state)
}

async fn not_found(State(state): State<AppState>, uri: Uri) -> impl IntoResponse {
    let path = uri.path().to_string();
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            code: "NOT_FOUND".to_string(),
            message: format!("No endpoint at {}", path),
            path,
            available: available_paths(&state.base_path, &state.endpoints),
        }),
    )
}
