//! Service configuration.
//!
//! Configuration is an immutable snapshot read once from environment-style
//! key/value pairs at startup. There is no hot reload; invalid values fail
//! fast with [`Error::Configuration`].

use std::time::Duration;

use crate::api::server::{ApiServerConfig, EndpointToggles};
use crate::error::{Error, Result};

/// Prefix shared by every configuration key.
pub const ENV_PREFIX: &str = "BEACON_";

/// Metric collection settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Master switch for tracking calls.
    pub enabled: bool,
    /// Prefix for every exposed series name.
    pub namespace: String,
    /// Labels attached to every exposed sample.
    pub default_labels: Vec<(String, String)>,
    /// Latencies below this are labelled `fast`.
    pub latency_fast: Duration,
    /// Latencies at or above this are labelled `slow`.
    pub latency_slow: Duration,
    /// Runtime sampler period.
    pub sample_interval: Duration,
    /// Per-probe health check deadline.
    pub health_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "beacon".to_string(),
            default_labels: Vec::new(),
            latency_fast: Duration::from_millis(100),
            latency_slow: Duration::from_millis(1000),
            sample_interval: Duration::from_secs(15),
            health_timeout: Duration::from_secs(5),
        }
    }
}

/// Push gateway settings.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub enabled: bool,
    /// Base URL of the push gateway, e.g. `http://pushgateway:9091`.
    pub gateway_url: Option<String>,
    /// Period of the serialize-and-buffer cycle.
    pub interval: Duration,
    /// Minimum time between timer-driven flushes; `None` flushes every cycle.
    pub flush_interval: Option<Duration>,
    /// Buffer depth that forces an immediate flush.
    pub max_batch_size: usize,
    /// Hard cap on buffered snapshots; the oldest are dropped beyond it.
    pub max_buffer_entries: usize,
    /// Buffered snapshots older than this are dropped by the cleanup task.
    pub buffer_max_age: Duration,
    /// Timeout for a single push request.
    pub timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub pool_size: usize,
    /// Idle pooled connections older than this are evicted.
    pub pool_idle_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_url: None,
            interval: Duration::from_secs(15),
            flush_interval: None,
            max_batch_size: 10,
            max_buffer_entries: 100,
            buffer_max_age: Duration::from_secs(3600),
            timeout: Duration::from_secs(5),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            pool_size: 5,
            pool_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name used as push job name and in health payloads.
    pub service_name: String,
    pub metrics: MetricsConfig,
    pub push: PushConfig,
    pub server: ApiServerConfig,
    /// Period of the stale-entry cleanup task.
    pub cleanup_interval: Duration,
    /// Budget for waiting on pending operations during shutdown.
    pub shutdown_timeout: Duration,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "beacon".to_string(),
            metrics: MetricsConfig::default(),
            push: PushConfig::default(),
            server: ApiServerConfig::default(),
            cleanup_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Keys are the full names (e.g. `BEACON_HTTP_PORT`). Missing keys take
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let metrics = MetricsConfig {
            enabled: env.bool("METRICS_ENABLED", defaults.metrics.enabled)?,
            namespace: env.string("METRICS_NAMESPACE", &defaults.metrics.namespace),
            default_labels: match env.get("DEFAULT_LABELS") {
                Some(raw) => parse_label_pairs(&raw)?,
                None => defaults.metrics.default_labels,
            },
            latency_fast: env.millis("LATENCY_FAST_MS", defaults.metrics.latency_fast)?,
            latency_slow: env.millis("LATENCY_SLOW_MS", defaults.metrics.latency_slow)?,
            sample_interval: env.millis("SAMPLE_INTERVAL_MS", defaults.metrics.sample_interval)?,
            health_timeout: env.millis("HEALTH_TIMEOUT_MS", defaults.metrics.health_timeout)?,
        };

        let push_defaults = defaults.push;
        let push = PushConfig {
            enabled: env.bool("PUSH_ENABLED", push_defaults.enabled)?,
            gateway_url: env.get("PUSH_GATEWAY_URL").or(push_defaults.gateway_url),
            interval: env.millis("PUSH_INTERVAL_MS", push_defaults.interval)?,
            flush_interval: match env.get("PUSH_FLUSH_INTERVAL_MS") {
                Some(_) => Some(env.millis("PUSH_FLUSH_INTERVAL_MS", Duration::ZERO)?),
                None => push_defaults.flush_interval,
            },
            max_batch_size: env.number("PUSH_MAX_BATCH_SIZE", push_defaults.max_batch_size)?,
            max_buffer_entries: env
                .number("PUSH_MAX_BUFFER_ENTRIES", push_defaults.max_buffer_entries)?,
            buffer_max_age: env.secs("PUSH_BUFFER_MAX_AGE_SECS", push_defaults.buffer_max_age)?,
            timeout: env.millis("PUSH_TIMEOUT_MS", push_defaults.timeout)?,
            breaker_failure_threshold: env.number(
                "BREAKER_FAILURE_THRESHOLD",
                push_defaults.breaker_failure_threshold,
            )?,
            breaker_cooldown: env.millis("BREAKER_COOLDOWN_MS", push_defaults.breaker_cooldown)?,
            pool_size: env.number("POOL_SIZE", push_defaults.pool_size)?,
            pool_idle_timeout: env.secs("POOL_IDLE_TIMEOUT_SECS", push_defaults.pool_idle_timeout)?,
        };

        let server_defaults = defaults.server;
        let toggles = server_defaults.endpoints;
        let server = ApiServerConfig {
            bind_address: env.string("HTTP_HOST", &server_defaults.bind_address),
            port: env.number("HTTP_PORT", server_defaults.port)?,
            base_path: normalize_base_path(&env.string("HTTP_BASE_PATH", &server_defaults.base_path)),
            enable_cors: env.bool("CORS_ENABLED", server_defaults.enable_cors)?,
            auth_token: env
                .get("AUTH_TOKEN")
                .filter(|token| !token.trim().is_empty())
                .or(server_defaults.auth_token),
            request_timeout: env.millis("REQUEST_TIMEOUT_MS", server_defaults.request_timeout)?,
            max_concurrent_requests: env.number(
                "MAX_CONCURRENT_REQUESTS",
                server_defaults.max_concurrent_requests,
            )?,
            endpoints: EndpointToggles {
                metrics: env.bool("ENDPOINT_METRICS_ENABLED", toggles.metrics)?,
                summary: env.bool("ENDPOINT_SUMMARY_ENABLED", toggles.summary)?,
                health: env.bool("ENDPOINT_HEALTH_ENABLED", toggles.health)?,
                ready: env.bool("ENDPOINT_READY_ENABLED", toggles.ready)?,
                live: env.bool("ENDPOINT_LIVE_ENABLED", toggles.live)?,
                info: env.bool("ENDPOINT_INFO_ENABLED", toggles.info)?,
                debug: env.bool("ENDPOINT_DEBUG_ENABLED", toggles.debug)?,
            },
        };

        let config = Self {
            service_name: env.string("SERVICE_NAME", &defaults.service_name),
            metrics,
            push,
            server,
            cleanup_interval: env.millis("CLEANUP_INTERVAL_MS", defaults.cleanup_interval)?,
            shutdown_timeout: env.millis("SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            log_dir: env.get("LOG_DIR").filter(|dir| !dir.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(Error::config("service name must not be empty"));
        }
        if self.server.port == 0 {
            return Err(Error::config("HTTP port must be between 1 and 65535"));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(Error::config("max concurrent requests must be at least 1"));
        }
        if self.metrics.latency_fast >= self.metrics.latency_slow {
            return Err(Error::config(format!(
                "fast latency threshold ({:?}) must be below the slow threshold ({:?})",
                self.metrics.latency_fast, self.metrics.latency_slow
            )));
        }
        if !is_valid_namespace(&self.metrics.namespace) {
            return Err(Error::config(format!(
                "metric namespace '{}' must match [a-zA-Z_:][a-zA-Z0-9_:]*",
                self.metrics.namespace
            )));
        }
        for (name, interval) in [
            ("sample interval", self.metrics.sample_interval),
            ("health check timeout", self.metrics.health_timeout),
            ("push interval", self.push.interval),
            ("push timeout", self.push.timeout),
            ("request timeout", self.server.request_timeout),
            ("cleanup interval", self.cleanup_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::config(format!("{} must be positive", name)));
            }
        }

        let push = &self.push;
        if push.breaker_failure_threshold == 0 {
            return Err(Error::config("circuit breaker failure threshold must be at least 1"));
        }
        if push.max_batch_size == 0 {
            return Err(Error::config("push max batch size must be at least 1"));
        }
        if push.max_buffer_entries < push.max_batch_size {
            return Err(Error::config(format!(
                "push buffer cap ({}) must be at least the batch size ({})",
                push.max_buffer_entries, push.max_batch_size
            )));
        }
        if push.pool_size == 0 {
            return Err(Error::config("pool size must be at least 1"));
        }
        if push.enabled {
            match push.gateway_url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(Error::config(format!(
                        "push gateway URL must be http(s): {}",
                        url
                    )));
                }
                None => {
                    return Err(Error::config("push is enabled but no gateway URL is set"));
                }
            }
        }
        Ok(())
    }
}

/// Empty, or a valid Prometheus metric name prefix.
fn is_valid_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        None => true,
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_' || first == ':')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
    }
}

/// Parse `k=v,k2=v2` into label pairs.
fn parse_label_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::config(format!("invalid default label '{}'", pair)))?;
            let key = key.trim();
            let valid_key = key
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_key {
                return Err(Error::config(format!("invalid default label name '{}'", key)));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `""`, `"/"` → `""`; `"api/"` → `"/api"`.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, key)).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &raw, "a boolean")),
            },
        }
    }

    fn number<N: std::str::FromStr>(&self, key: &str, default: N) -> Result<N> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| invalid(key, &raw, "a non-negative integer")),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.number(key, 0u64).map(Duration::from_millis),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.number(key, 0u64).map(Duration::from_secs),
        }
    }
}

fn invalid(key: &str, raw: &str, expected: &str) -> Error {
    Error::config(format!(
        "{}{} must be {}, got '{}'",
        ENV_PREFIX, key, expected, raw
    ))
}
