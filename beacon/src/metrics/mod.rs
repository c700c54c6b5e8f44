//! Metrics and monitoring module.
//!
//! Provides the metric registry, the tracking API used by the rest of the
//! service, Prometheus exposition, runtime sampling and health checks.
//!
//! # Example
//!
//! ```ignore
//! use beacon::metrics::{MessageEvent, MessageOutcome};
//!
//! service.collector().record_message(MessageEvent {
//!     trigger: "!help",
//!     channel: "#general",
//!     outcome: MessageOutcome::Responded,
//!     latency: Some(elapsed),
//! });
//!
//! let report = service.health().run_all().await;
//! ```

mod collector;
mod health;
pub mod labels;
pub mod prometheus;
mod registry;
mod sampler;

pub use collector::{
    DropReason, HttpRequestEvent, MessageEvent, MetricsCollector, PushOutcome, RuntimeGauge,
    series,
};
pub use health::{
    CheckResult, CheckStatus, HealthAggregator, HealthCheck, HealthReport, HealthStatus,
    ProbeOutcome, Readiness,
};
pub use labels::{LatencyThresholds, MessageOutcome, SpeedCategory, sanitize_label_value};
pub use prometheus::PrometheusExporter;
pub use registry::{
    DEFAULT_LATENCY_BUCKETS, MetricKind, MetricRegistry, MetricsError, SeriesDescriptor,
    SeriesSummary,
};
pub use sampler::{ProcessStats, RuntimeSampler};
