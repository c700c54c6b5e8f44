//! Delivery of serialized snapshots to the push gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::metrics::labels::sanitize_label_value;
use crate::metrics::prometheus;
use crate::utils::http_client::build_push_client;

/// Longest response body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open push connection: {0}")]
    Connect(String),

    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("push gateway responded with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// A sink for exposition payloads.
///
/// `connect` builds a reusable connection handle; `send` delivers one payload
/// over it. Both are used through the resource pool and circuit breaker of
/// the push pipeline.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Dependency name used for the breaker and pool.
    fn name(&self) -> &str;

    fn connect(&self) -> Result<Self::Connection, TransportError>;

    async fn send(&self, connection: &Self::Connection, payload: &str)
    -> Result<(), TransportError>;
}

/// `POST {gateway}/metrics/job/{service}` over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    endpoint: String,
    timeout: Duration,
}

impl HttpPushTransport {
    pub fn new(gateway_url: &str, service_name: &str, timeout: Duration) -> Self {
        let endpoint = format!(
            "{}/metrics/job/{}",
            gateway_url.trim_end_matches('/'),
            sanitize_label_value(service_name)
        );
        Self { endpoint, timeout }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    type Connection = reqwest::Client;

    fn name(&self) -> &str {
        "push_gateway"
    }

    fn connect(&self) -> Result<reqwest::Client, TransportError> {
        build_push_client(self.timeout).map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn send(&self, client: &reqwest::Client, payload: &str) -> Result<(), TransportError> {
        let response = client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, prometheus::CONTENT_TYPE)
            .body(payload.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
