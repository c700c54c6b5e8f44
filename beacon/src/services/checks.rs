//! Health checks registered by default.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::metrics::{HealthCheck, MetricsCollector, ProbeOutcome};
use crate::push::PushDriver;

/// Reports the registry size; warns when collection is switched off.
pub struct RegistryCheck {
    collector: Arc<MetricsCollector>,
}

impl RegistryCheck {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl HealthCheck for RegistryCheck {
    async fn probe(&self) -> anyhow::Result<ProbeOutcome> {
        let series = self.collector.registry().series_count();
        if !self.collector.is_enabled() {
            return Ok(ProbeOutcome::warn(format!(
                "metric collection disabled ({} series registered)",
                series
            )));
        }
        Ok(ProbeOutcome::pass(format!("{} series registered", series)))
    }
}

/// Warns when tracking calls failed since the previous probe.
pub struct TrackingErrorsCheck {
    collector: Arc<MetricsCollector>,
    last_seen: AtomicU64,
}

impl TrackingErrorsCheck {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        let last_seen = AtomicU64::new(collector.tracking_errors());
        Self {
            collector,
            last_seen,
        }
    }
}

#[async_trait]
impl HealthCheck for TrackingErrorsCheck {
    async fn probe(&self) -> anyhow::Result<ProbeOutcome> {
        let total = self.collector.tracking_errors();
        let previous = self.last_seen.swap(total, Ordering::Relaxed);
        let new_errors = total.saturating_sub(previous);

        if new_errors > 0 {
            Ok(ProbeOutcome::warn(format!(
                "{} tracking errors since last check ({} total)",
                new_errors, total
            )))
        } else {
            Ok(ProbeOutcome::pass(format!("{} tracking errors total", total)))
        }
    }
}

/// Reports breaker state and buffer pressure of the push pipeline.
pub struct PushGatewayCheck {
    push: Arc<dyn PushDriver>,
}

impl PushGatewayCheck {
    pub fn new(push: Arc<dyn PushDriver>) -> Self {
        Self { push }
    }
}

#[async_trait]
impl HealthCheck for PushGatewayCheck {
    async fn probe(&self) -> anyhow::Result<ProbeOutcome> {
        let status = self.push.status();
        let summary = format!(
            "breaker {}, {} of {} buffered",
            status.breaker_state, status.buffer_depth, status.max_buffer_entries
        );

        if status.breaker_state != "closed" {
            return Ok(ProbeOutcome::warn(match status.last_error {
                Some(error) => format!("{}; last error: {}", summary, error),
                None => summary,
            }));
        }
        if status.buffer_depth >= status.max_buffer_entries {
            return Ok(ProbeOutcome::warn(format!("{}; buffer full", summary)));
        }
        Ok(ProbeOutcome::pass(summary))
    }
}
