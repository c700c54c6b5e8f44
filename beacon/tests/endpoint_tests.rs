//! Endpoint tests.
//!
//! Drive the fully layered router with `oneshot` against a real
//! `TelemetryService` with push disabled.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use beacon::api::{ApiServer, AppState};
use beacon::metrics::{MessageEvent, MessageOutcome, ProbeOutcome, series};
use beacon::{ServiceConfig, TelemetryService};
use serde_json::Value;
use tower::ServiceExt;

async fn setup(config: ServiceConfig) -> (Arc<TelemetryService>, Router) {
    let server_config = config.server.clone();
    let service = TelemetryService::init(config)
        .await
        .expect("Failed to start telemetry service");
    let server = ApiServer::new(server_config, AppState::new(Arc::clone(&service)));
    (service, server.router())
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn get_with_token(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Count recorded in `http_requests_total` for one method, route and status.
fn http_requests(service: &TelemetryService, route: &str, status: &str) -> Option<f64> {
    let labels = ["get", route, status].map(str::to_string);
    service.registry().value(series::HTTP_REQUESTS, &labels)
}

mod scrape_tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_exposition() {
        let mut config = ServiceConfig::default();
        config.metrics.default_labels = vec![("env".to_string(), "test".to_string())];
        let (service, app) = setup(config).await;

        service.collector().record_message(MessageEvent {
            trigger: "!help",
            channel: "#general",
            outcome: MessageOutcome::Responded,
            latency: None,
        });

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());

        let body = body_text(response).await;
        assert!(body.contains("# TYPE beacon_messages_processed_total counter"));
        assert!(body.contains("env=\"test\""));
        assert!(body.contains("trigger=\"_help\""));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_summary_counts_series() {
        let (service, app) = setup(ServiceConfig::default()).await;
        service.collector().increment_custom("notes", "created", 2);

        let response = app.oneshot(get("/metrics/summary")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["service"], "beacon");
        let series = json["series"].as_array().unwrap();
        assert_eq!(json["total_series"].as_u64().unwrap() as usize, series.len());

        let custom = series
            .iter()
            .find(|s| s["name"] == "custom_events_total")
            .unwrap();
        assert_eq!(custom["type"], "counter");
        assert_eq!(custom["cardinality"], 1);
        assert!(json["total_samples"].as_u64().unwrap() >= 1);

        service.shutdown().await;
    }
}

mod probe_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_healthy() {
        let (service, app) = setup(ServiceConfig::default()).await;

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "beacon");
        let checks = json["checks"].as_array().unwrap();
        assert!(checks.iter().any(|c| c["name"] == "registry"));
        assert!(checks.iter().all(|c| c["status"] == "pass"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_unhealthy_returns_503() {
        let (service, app) = setup(ServiceConfig::default()).await;
        service
            .health()
            .register_fn("database", || async { Ok(ProbeOutcome::fail("connection refused")) });

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");

        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "not_ready");
        assert!(json["reason"].as_str().unwrap().contains("database"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_is_not_ready() {
        let (service, app) = setup(ServiceConfig::default()).await;
        service
            .health()
            .register_fn("cache", || async { Ok(ProbeOutcome::warn("hit rate low")) });

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "degraded");

        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_probes_flip_on_shutdown() {
        let (service, app) = setup(ServiceConfig::default()).await;

        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ready");
        assert!(json.get("reason").is_none());

        let response = app.clone().oneshot(get("/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "alive");

        service.shutdown().await;

        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["reason"], "shutting down");

        let response = app.oneshot(get("/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "shutting_down");
    }
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_path_lists_available() {
        let (service, app) = setup(ServiceConfig::default()).await;

        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["path"], "/nope");
        let available: Vec<&str> = json["available"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(available.contains(&"/metrics"));
        assert!(!available.contains(&"/debug"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_endpoint_is_404() {
        let mut config = ServiceConfig::default();
        config.server.endpoints.metrics = false;
        let (service, app) = setup(config).await;

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        let available = json["available"].as_array().unwrap();
        assert!(!available.iter().any(|p| *p == "/metrics"));
        assert!(available.iter().any(|p| *p == "/metrics/summary"));

        let response = app.oneshot(get("/metrics/summary")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_base_path() {
        let mut config = ServiceConfig::default();
        config.server.base_path = "/ops".to_string();
        let (service, app) = setup(config).await;

        let response = app.clone().oneshot(get("/ops/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(
            json["available"]
                .as_array()
                .unwrap()
                .iter()
                .all(|p| p.as_str().unwrap().starts_with("/ops/"))
        );

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_info_and_debug() {
        let mut config = ServiceConfig::default();
        config.server.endpoints.debug = true;
        let (service, app) = setup(config).await;

        let response = app.clone().oneshot(get("/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "beacon");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["features"]["collection"], true);
        assert_eq!(json["features"]["push"], false);
        assert_eq!(json["features"]["debug"], true);
        assert!(json["memory"]["resident_bytes"].is_u64());

        let response = app.oneshot(get("/debug")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["shutting_down"], false);
        // The debug request itself is in flight.
        assert_eq!(json["pending_operations"], 1);
        assert_eq!(json["tracking_errors"], 0);
        assert!(json["push"].is_null());

        service.shutdown().await;
    }
}

mod auth_tests {
    use super::*;

    async fn secured() -> (Arc<TelemetryService>, Router) {
        let mut config = ServiceConfig::default();
        config.server.auth_token = Some("s3cret".to_string());
        setup(config).await
    }

    #[tokio::test]
    async fn test_missing_token() {
        let (service, app) = secured().await;

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["code"], "UNAUTHORIZED");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_token() {
        let (service, app) = secured().await;

        let response = app
            .oneshot(get_with_token("/health", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_valid_token_and_open_probes() {
        let (service, app) = secured().await;

        let response = app
            .clone()
            .oneshot(get_with_token("/metrics", "s3cret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for path in ["/live", "/ready"] {
            let response = app.clone().oneshot(get(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{} should stay open", path);
        }

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejections_are_counted() {
        let (service, app) = secured().await;

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app
            .oneshot(get_with_token("/metrics", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(http_requests(&service, "_metrics", "401"), Some(2.0));
        assert_eq!(http_requests(&service, "_metrics", "200"), None);

        service.shutdown().await;
    }
}

mod limits_tests {
    use std::time::Duration;

    use super::*;

    /// Register a health check that takes `delay` to answer.
    fn slow_check(service: &TelemetryService, delay: Duration) {
        service.health().register_fn("slow", move || async move {
            tokio::time::sleep(delay).await;
            Ok(ProbeOutcome::pass("answered"))
        });
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_counted() {
        let mut config = ServiceConfig::default();
        config.server.max_concurrent_requests = 1;
        let (service, app) = setup(config).await;
        slow_check(&service, Duration::from_millis(300));

        let in_flight = tokio::spawn(app.clone().oneshot(get("/health")));
        while service.lifecycle().pending_operations() == 0 {
            tokio::task::yield_now().await;
        }

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await["code"], "TOO_MANY_REQUESTS");

        let response = in_flight.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(http_requests(&service, "_metrics", "429"), Some(1.0));
        assert_eq!(http_requests(&service, "_health", "200"), Some(1.0));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_is_counted() {
        let mut config = ServiceConfig::default();
        config.server.request_timeout = Duration::from_millis(50);
        let (service, app) = setup(config).await;
        slow_check(&service, Duration::from_millis(500));

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "SERVICE_UNAVAILABLE");

        assert_eq!(http_requests(&service, "_health", "503"), Some(1.0));
        assert_eq!(service.lifecycle().pending_operations(), 0);

        service.shutdown().await;
    }
}
