//! Per-request timing.
//!
//! Reports every request to the collector and keeps an operation guard alive
//! while it is served, so shutdown waits for in-flight requests.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::time::Instant;

use crate::api::server::AppState;
use crate::metrics::HttpRequestEvent;

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub async fn track_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let _guard = state.service.begin_operation();
    let started = Instant::now();

    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let response = next.run(request).await;

    state.service.collector().record_http_request(HttpRequestEvent {
        method: &method,
        route: &route,
        status: response.status().as_u16(),
        duration: started.elapsed(),
    });

    response
}
