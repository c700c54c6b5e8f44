//! beacon library crate.
//!
//! An in-process telemetry pipeline: a metric registry with a typed tracking
//! API, a Prometheus scrape endpoint, an optional push gateway client guarded
//! by a circuit breaker and connection pool, and health probes.
//!
//! Everything hangs off [`TelemetryService`]; [`api::ApiServer`] exposes it
//! over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod push;
pub mod services;
pub mod utils;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use services::TelemetryService;
