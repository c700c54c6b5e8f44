//! Service information and debug routes.

use axum::{Json, extract::State};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    DebugResponse, InfoResponse, LogFilterResponse, MemoryInfo, UpdateLogFilterRequest,
};
use crate::api::server::AppState;
use crate::logging::LoggingConfig;

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let sampler = state.service.sampler();
    let stats = sampler.process_stats();

    Json(InfoResponse {
        service: state.service.config().service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.service.lifecycle().uptime().as_secs(),
        pid: sampler.pid(),
        memory: MemoryInfo {
            resident_bytes: stats.resident_bytes,
            virtual_bytes: stats.virtual_bytes,
        },
        features: state.features,
    })
}

pub async fn debug(State(state): State<AppState>) -> Json<DebugResponse> {
    let service = &state.service;
    let logging = state.logging_config.as_deref();

    Json(DebugResponse {
        pending_operations: service.lifecycle().pending_operations(),
        shutting_down: service.is_shutting_down(),
        tracking_errors: service.collector().tracking_errors(),
        push: service.push().map(|push| push.status()),
        log_filter: logging.map(LoggingConfig::get_filter),
        log_dir: logging.and_then(log_dir_display),
    })
}

fn logging_config(state: &AppState) -> ApiResult<&LoggingConfig> {
    state
        .logging_config
        .as_deref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))
}

fn log_dir_display(logging: &LoggingConfig) -> Option<String> {
    logging.log_dir().map(|dir| dir.display().to_string())
}

/// Current log filter.
pub async fn log_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterResponse>> {
    let logging = logging_config(&state)?;

    Ok(Json(LogFilterResponse {
        filter: logging.get_filter(),
        log_dir: log_dir_display(logging),
    }))
}

/// Replace the log filter; an invalid directive is a 400.
pub async fn update_log_filter(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LogFilterResponse>> {
    let logging = logging_config(&state)?;
    logging.set_filter(&request.filter)?;

    Ok(Json(LogFilterResponse {
        filter: logging.get_filter(),
        log_dir: log_dir_display(logging),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use tower::ServiceExt;
    use tracing_subscriber::{EnvFilter, reload};

    use crate::api::server::{ApiServer, AppState};
    use crate::config::ServiceConfig;
    use crate::logging::{DEFAULT_LOG_FILTER, LoggingConfig};
    use crate::services::TelemetryService;

    fn debug_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.server.endpoints.debug = true;
        config
    }

    fn put_filter(filter: &str) -> Request<Body> {
        Request::builder()
            .method(Method::PUT)
            .uri("/debug/log-filter")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "filter": filter }).to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_update_log_filter() {
        let (_layer, handle) = reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(
            EnvFilter::new(DEFAULT_LOG_FILTER),
        );
        let logging = Arc::new(LoggingConfig::new(handle, Some("/var/log/beacon".into())));

        let config = debug_config();
        let server_config = config.server.clone();
        let service = TelemetryService::init(config).await.unwrap();
        let state = AppState::new(Arc::clone(&service)).with_logging_config(Arc::clone(&logging));
        let app = ApiServer::new(server_config, state).router();

        let response = app.clone().oneshot(put_filter("beacon=debug")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["filter"], "beacon=debug");
        assert_eq!(body["log_dir"], "/var/log/beacon");
        assert_eq!(logging.get_filter(), "beacon=debug");

        let response = app.clone().oneshot(put_filter("beacon=loud")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "BAD_REQUEST");
        assert_eq!(logging.get_filter(), "beacon=debug");

        let request = Request::builder()
            .uri("/debug")
            .body(Body::empty())
            .unwrap();
        let body = json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(body["log_filter"], "beacon=debug");
        assert_eq!(body["log_dir"], "/var/log/beacon");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_filter_without_logging() {
        let config = debug_config();
        let server_config = config.server.clone();
        let service = TelemetryService::init(config).await.unwrap();
        let app = ApiServer::new(server_config, AppState::new(Arc::clone(&service))).router();

        let request = Request::builder()
            .uri("/debug/log-filter")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json(response).await["code"], "INTERNAL_ERROR");

        service.shutdown().await;
    }
}
