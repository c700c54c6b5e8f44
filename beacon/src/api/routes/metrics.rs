//! Scrape and summary routes.

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;

use crate::api::models::SummaryResponse;
use crate::api::server::AppState;
use crate::metrics::prometheus::CONTENT_TYPE;

/// Prometheus text exposition.
pub async fn scrape(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.service.exporter().export();
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}

/// JSON overview of registered series.
pub async fn summary(State(state): State<AppState>) -> Json<SummaryResponse> {
    let series = state.service.registry().summary();
    let total_samples = series.iter().map(|s| s.cardinality).sum();

    Json(SummaryResponse {
        service: state.service.config().service_name.clone(),
        timestamp: Utc::now().to_rfc3339(),
        total_series: series.len(),
        total_samples,
        series,
    })
}
