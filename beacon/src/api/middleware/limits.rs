//! Concurrency ceiling and request timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Semaphore;

use crate::api::error::ApiError;

/// Shared permit pool bounding in-flight requests.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    permits: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyLimit {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.max - self.permits.available_permits()
    }
}

/// Reject with 429 when every permit is taken.
pub async fn limit_concurrency(
    State(limit): State<ConcurrencyLimit>,
    request: Request,
    next: Next,
) -> Response {
    let Ok(_permit) = Arc::clone(&limit.permits).try_acquire_owned() else {
        tracing::warn!(
            max = limit.max,
            path = %request.uri().path(),
            "Concurrent request limit reached"
        );
        return ApiError::too_many_requests(format!(
            "Too many concurrent requests (limit {})",
            limit.max
        ))
        .into_response();
    };

    next.run(request).await
}

/// Per-request deadline.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout(pub Duration);

/// Answer 503 when the handler overruns its deadline.
pub async fn enforce_timeout(
    State(RequestTimeout(timeout)): State<RequestTimeout>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(path = %path, timeout = ?timeout, "Request timed out");
            ApiError::service_unavailable("Request timed out").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn request(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_limit_rejects_when_exhausted() {
        let limit = ConcurrencyLimit::new(1);
        let app = Router::new()
            .route("/metrics", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                limit.clone(),
                limit_concurrency,
            ));

        let held = Arc::clone(&limit.permits).try_acquire_owned().unwrap();
        assert_eq!(limit.in_flight(), 1);

        let response = app.clone().oneshot(request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        drop(held);
        let response = app.oneshot(request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(limit.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_503() {
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "late"
                }),
            )
            .route("/fast", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                RequestTimeout(Duration::from_secs(1)),
                enforce_timeout,
            ));

        let response = app.clone().oneshot(request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.oneshot(request("/fast")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
