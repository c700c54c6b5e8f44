//! Bearer token authentication middleware.
//!
//! Probe paths stay reachable without a token so orchestrators can poll them.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::error::ApiError;

/// Bearer token authentication configuration.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    token: Arc<str>,
    /// Full request paths that skip authentication.
    open_paths: Arc<[String]>,
}

impl BearerAuth {
    pub fn new(token: impl Into<Arc<str>>, open_paths: Vec<String>) -> Self {
        Self {
            token: token.into(),
            open_paths: open_paths.into(),
        }
    }

    /// Exempt the liveness and readiness probes under `base_path`.
    pub fn with_probe_exemptions(token: impl Into<Arc<str>>, base_path: &str) -> Self {
        Self::new(
            token,
            vec![format!("{}/live", base_path), format!("{}/ready", base_path)],
        )
    }

    /// Check if a presented token is valid.
    pub fn is_valid(&self, presented: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), presented.as_bytes())
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.open_paths.iter().any(|open| open == path)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware function for bearer token authentication.
pub async fn require_bearer(State(auth): State<BearerAuth>, request: Request, next: Next) -> Response {
    if auth.is_open(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if auth.is_valid(token) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Invalid bearer token provided");
            ApiError::unauthorized("Invalid bearer token").into_response()
        }
        None => {
            tracing::debug!(path = %request.uri().path(), "Missing bearer token in request");
            ApiError::unauthorized("Missing bearer token").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        let auth = BearerAuth::with_probe_exemptions("secret", "/ops");
        Router::new()
            .route("/ops/metrics", get(|| async { "metrics" }))
            .route("/ops/live", get(|| async { "alive" }))
            .layer(axum::middleware::from_fn_with_state(auth, require_bearer))
    }

    fn request(path: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_probe_exemptions() {
        let auth = BearerAuth::with_probe_exemptions("secret", "");
        assert!(auth.is_open("/live"));
        assert!(auth.is_open("/ready"));
        assert!(!auth.is_open("/metrics"));
        assert!(auth.is_valid("secret"));
        assert!(!auth.is_valid("Secret"));
    }

    #[test]
    fn test_token_comparison() {
        let auth = BearerAuth::new("secret", Vec::new());
        assert!(auth.is_valid("secret"));
        assert!(!auth.is_valid("secreT"));
        assert!(!auth.is_valid("secret2"));
        assert!(!auth.is_valid(""));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let response = app().oneshot(request("/ops/metrics", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let response = app()
            .oneshot(request("/ops/metrics", Some("guess")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let response = app()
            .oneshot(request("/ops/metrics", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_is_open() {
        let response = app().oneshot(request("/ops/live", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
