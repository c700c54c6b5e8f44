//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::Response;
use axum::middleware::from_fn_with_state;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::middleware::{
    BearerAuth, ConcurrencyLimit, RequestTimeout, enforce_timeout, limit_concurrency,
    require_bearer, track_request,
};
use crate::api::models::FeatureFlags;
use crate::api::routes;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::services::TelemetryService;

/// Per-endpoint enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointToggles {
    pub metrics: bool,
    pub summary: bool,
    pub health: bool,
    pub ready: bool,
    pub live: bool,
    pub info: bool,
    pub debug: bool,
}

impl Default for EndpointToggles {
    fn default() -> Self {
        Self {
            metrics: true,
            summary: true,
            health: true,
            ready: true,
            live: true,
            info: true,
            debug: false,
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Prefix for every endpoint path; empty or `/segment`
    pub base_path: String,
    /// Enable CORS
    pub enable_cors: bool,
    /// Bearer token required on every path except the probes
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub endpoints: EndpointToggles,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9464,
            base_path: String::new(),
            enable_cors: false,
            auth_token: None,
            request_timeout: Duration::from_secs(30),
            max_concurrent_requests: 100,
            endpoints: EndpointToggles::default(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Telemetry service backing every endpoint
    pub service: Arc<TelemetryService>,
    pub endpoints: EndpointToggles,
    pub base_path: String,
    /// Feature summary reported by `/info`
    pub features: FeatureFlags,
    /// Logging configuration, reported by `/debug`
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    /// Create state from the service and its server settings.
    pub fn new(service: Arc<TelemetryService>) -> Self {
        let config = service.config();
        let server = &config.server;
        let features = FeatureFlags {
            collection: config.metrics.enabled,
            push: service.push().is_some(),
            auth: server.auth_token.is_some(),
            cors: server.enable_cors,
            debug: server.endpoints.debug,
        };

        Self {
            endpoints: server.endpoints,
            base_path: server.base_path.clone(),
            features,
            logging_config: None,
            service,
        }
    }

    /// Set the logging configuration.
    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

/// Probe paths are polled constantly; keep them out of request spans.
fn is_probe_path(path: &str) -> bool {
    path.ends_with("/health") || path.ends_with("/ready") || path.ends_with("/live")
}

fn request_span(req: &Request) -> Span {
    if is_probe_path(req.uri().path()) {
        return Span::none();
    }
    tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
}

fn log_response(res: &Response<Body>, latency: Duration, span: &Span) {
    if span.is_disabled() {
        return;
    }
    tracing::info!(
        parent: span,
        status = res.status().as_u16(),
        latency_ms = latency.as_millis() as u64,
        "Request served"
    );
}

fn log_failure(class: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    if span.is_disabled() {
        return;
    }
    tracing::error!(
        parent: span,
        classification = %class,
        latency_ms = latency.as_millis() as u64,
        "Request failed"
    );
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    ///
    /// Layers from the outside in: tracing, CORS, timing, concurrency
    /// ceiling, authentication, request timeout. Timing sits outside the
    /// rejecting layers so 401, 429 and timeout responses are counted too.
    pub fn router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone()).layer(from_fn_with_state(
            RequestTimeout(self.config.request_timeout),
            enforce_timeout,
        ));

        if let Some(token) = &self.config.auth_token {
            let auth = BearerAuth::with_probe_exemptions(token.as_str(), &self.config.base_path);
            router = router.layer(from_fn_with_state(auth, require_bearer));
        }

        router = router.layer(from_fn_with_state(
            ConcurrencyLimit::new(self.config.max_concurrent_requests),
            limit_concurrency,
        ));

        router = router.layer(from_fn_with_state(self.state.clone(), track_request));

        // Add CORS if enabled
        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_response(log_response)
                .on_failure(log_failure),
        )
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::ApiError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let router = self.router();
        let addr = listener.local_addr()?;

        tracing::info!(
            "Telemetry endpoints listening on http://{}{}",
            addr,
            self.config.base_path
        );

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| Error::ApiError(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
