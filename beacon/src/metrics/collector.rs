//! Metrics collector implementation.
//!
//! The tracking API used by the rest of the service. Every method returns
//! `()`: failures are logged and counted in `tracking_errors_total`, never
//! propagated to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use resilience::CircuitState;
use tracing::{trace, warn};

use super::labels::{
    BreakerLabels, ChannelLabels, CustomEventLabels, HttpRequestLabels, LatencyThresholds,
    MessageLabels, MessageOutcome, sanitize_label_value,
};
use super::registry::{
    DEFAULT_LATENCY_BUCKETS, MetricRegistry, MetricsError, SeriesDescriptor,
};

/// Series names registered by [`MetricsCollector`].
pub mod series {
    pub const MESSAGES_PROCESSED: &str = "messages_processed_total";
    pub const MESSAGE_DURATION: &str = "message_processing_seconds";
    pub const CHANNEL_ACTIVITY: &str = "channel_activity_total";
    pub const CHANNELS_ACTIVE: &str = "channels_active";
    pub const BREAKER_TRANSITIONS: &str = "circuit_breaker_transitions_total";
    pub const BREAKER_STATE: &str = "circuit_breaker_state";
    pub const HTTP_REQUESTS: &str = "http_requests_total";
    pub const HTTP_DURATION: &str = "http_request_duration_seconds";
    pub const CUSTOM_EVENTS: &str = "custom_events_total";
    pub const ERRORS: &str = "errors_total";
    pub const PUSH_ATTEMPTS: &str = "push_attempts_total";
    pub const PUSH_DROPPED: &str = "push_buffer_dropped_total";
    pub const TRACKING_ERRORS: &str = "tracking_errors_total";
    pub const RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
    pub const VIRTUAL_MEMORY: &str = "process_virtual_memory_bytes";
    pub const CPU_USAGE: &str = "process_cpu_usage_percent";
    pub const UPTIME: &str = "process_uptime_seconds";
    pub const PENDING_OPERATIONS: &str = "pending_operations";
    pub const PUSH_BUFFER_DEPTH: &str = "push_buffer_depth";
}

fn default_series() -> Vec<SeriesDescriptor> {
    use series::*;

    vec![
        SeriesDescriptor::counter(
            MESSAGES_PROCESSED,
            "Messages handled by responders",
            &MessageLabels::NAMES,
        ),
        SeriesDescriptor::histogram(
            MESSAGE_DURATION,
            "Message processing latency in seconds",
            &["trigger", "speed"],
            &DEFAULT_LATENCY_BUCKETS,
        ),
        SeriesDescriptor::counter(
            CHANNEL_ACTIVITY,
            "Channel activity events",
            &ChannelLabels::NAMES,
        ),
        SeriesDescriptor::gauge(CHANNELS_ACTIVE, "Distinct channels seen", &[]),
        SeriesDescriptor::counter(
            BREAKER_TRANSITIONS,
            "Circuit breaker state transitions",
            &BreakerLabels::NAMES,
        ),
        SeriesDescriptor::gauge(
            BREAKER_STATE,
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            &["dependency"],
        ),
        SeriesDescriptor::counter(
            HTTP_REQUESTS,
            "HTTP requests served",
            &HttpRequestLabels::NAMES,
        ),
        SeriesDescriptor::histogram(
            HTTP_DURATION,
            "HTTP request duration in seconds",
            &["method", "route", "speed"],
            &DEFAULT_LATENCY_BUCKETS,
        ),
        SeriesDescriptor::counter(
            CUSTOM_EVENTS,
            "Custom business events",
            &CustomEventLabels::NAMES,
        ),
        SeriesDescriptor::counter(ERRORS, "Errors by component", &["component", "kind"]),
        SeriesDescriptor::counter(PUSH_ATTEMPTS, "Push attempts by outcome", &["outcome"]),
        SeriesDescriptor::counter(
            PUSH_DROPPED,
            "Buffered push payloads dropped before delivery",
            &["reason"],
        ),
        SeriesDescriptor::counter(
            TRACKING_ERRORS,
            "Tracking calls that failed internally",
            &["operation"],
        ),
        SeriesDescriptor::gauge(RESIDENT_MEMORY, "Resident memory in bytes", &[]),
        SeriesDescriptor::gauge(VIRTUAL_MEMORY, "Virtual memory in bytes", &[]),
        SeriesDescriptor::gauge(CPU_USAGE, "Process CPU usage in percent", &[]),
        SeriesDescriptor::gauge(UPTIME, "Process uptime in seconds", &[]),
        SeriesDescriptor::gauge(PENDING_OPERATIONS, "In-flight tracked operations", &[]),
        SeriesDescriptor::gauge(PUSH_BUFFER_DEPTH, "Payloads waiting to be pushed", &[]),
    ]
}

/// A processed message.
#[derive(Debug, Clone, Copy)]
pub struct MessageEvent<'a> {
    pub trigger: &'a str,
    pub channel: &'a str,
    pub outcome: MessageOutcome,
    pub latency: Option<Duration>,
}

/// A served HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequestEvent<'a> {
    pub method: &'a str,
    pub route: &'a str,
    pub status: u16,
    pub duration: Duration,
}

/// Outcome of a single push delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Success,
    Failure,
    /// Refused by the open circuit breaker without a network call.
    Rejected,
}

impl PushOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            PushOutcome::Success => "success",
            PushOutcome::Failure => "failure",
            PushOutcome::Rejected => "rejected",
        }
    }
}

/// Why buffered payloads were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Overflow,
    Expired,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::Overflow => "overflow",
            DropReason::Expired => "expired",
        }
    }
}

/// Gauges refreshed by the runtime sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeGauge {
    ResidentMemory,
    VirtualMemory,
    CpuUsage,
    Uptime,
    PendingOperations,
    PushBufferDepth,
}

impl RuntimeGauge {
    fn series(&self) -> &'static str {
        match self {
            RuntimeGauge::ResidentMemory => series::RESIDENT_MEMORY,
            RuntimeGauge::VirtualMemory => series::VIRTUAL_MEMORY,
            RuntimeGauge::CpuUsage => series::CPU_USAGE,
            RuntimeGauge::Uptime => series::UPTIME,
            RuntimeGauge::PendingOperations => series::PENDING_OPERATIONS,
            RuntimeGauge::PushBufferDepth => series::PUSH_BUFFER_DEPTH,
        }
    }
}

/// Metrics collector for the telemetry service.
#[derive(Debug)]
pub struct MetricsCollector {
    registry: Arc<MetricRegistry>,
    enabled: bool,
    thresholds: LatencyThresholds,
    tracking_errors: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector and register its series.
    pub fn new(
        registry: Arc<MetricRegistry>,
        enabled: bool,
        thresholds: LatencyThresholds,
    ) -> Result<Self, MetricsError> {
        for descriptor in default_series() {
            registry.register(descriptor)?;
        }

        Ok(Self {
            registry,
            enabled,
            thresholds,
            tracking_errors: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of tracking calls that failed internally since startup.
    pub fn tracking_errors(&self) -> u64 {
        self.tracking_errors.load(Ordering::Relaxed)
    }

    // ========== Message Metrics ==========

    /// Record a message handled by a responder.
    pub fn record_message(&self, event: MessageEvent<'_>) {
        self.track("record_message", || {
            let labels = MessageLabels {
                trigger: event.trigger,
                channel: event.channel,
                outcome: event.outcome,
            }
            .build();
            self.registry
                .inc_counter(series::MESSAGES_PROCESSED, &labels, 1.0)?;

            if let Some(latency) = event.latency {
                let speed = self.thresholds.classify(latency);
                let [trigger, _, _] = labels;
                self.registry.observe(
                    series::MESSAGE_DURATION,
                    &[trigger, speed.as_str().to_string()],
                    latency.as_secs_f64(),
                )?;
            }
            Ok(())
        });
    }

    /// Record channel activity (joins, messages, ...).
    pub fn record_channel_activity(&self, channel: &str, activity: &str) {
        self.track("record_channel_activity", || {
            let labels = ChannelLabels { channel, activity }.build();
            self.registry
                .inc_counter(series::CHANNEL_ACTIVITY, &labels, 1.0)?;

            // Derived from the activity series so it resets with the registry.
            let active = self
                .registry
                .distinct_label_values(series::CHANNEL_ACTIVITY, 0)?;
            self.registry
                .set_gauge(series::CHANNELS_ACTIVE, &[], active as f64)
        });
    }

    // ========== Dependency Metrics ==========

    /// Record a circuit breaker transition.
    pub fn record_circuit_breaker_activation(&self, dependency: &str, state: CircuitState) {
        self.track("record_circuit_breaker_activation", || {
            let labels = BreakerLabels { dependency, state }.build();
            self.registry
                .inc_counter(series::BREAKER_TRANSITIONS, &labels, 1.0)?;

            let level = match state {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 1.0,
                CircuitState::Open => 2.0,
            };
            let [dependency, _] = labels;
            self.registry
                .set_gauge(series::BREAKER_STATE, &[dependency], level)
        });
    }

    // ========== HTTP Metrics ==========

    /// Record a served HTTP request.
    pub fn record_http_request(&self, event: HttpRequestEvent<'_>) {
        self.track("record_http_request", || {
            let labels = HttpRequestLabels {
                method: event.method,
                route: event.route,
                status: event.status,
            }
            .build();
            self.registry
                .inc_counter(series::HTTP_REQUESTS, &labels, 1.0)?;

            let speed = self.thresholds.classify(event.duration);
            let [method, route, _] = labels;
            self.registry.observe(
                series::HTTP_DURATION,
                &[method, route, speed.as_str().to_string()],
                event.duration.as_secs_f64(),
            )
        });
    }

    // ========== Generic Metrics ==========

    /// Add `amount` to a custom business counter.
    pub fn increment_custom(&self, domain: &str, event: &str, amount: u64) {
        self.track("increment_custom", || {
            let labels = CustomEventLabels { domain, event }.build();
            self.registry
                .inc_counter(series::CUSTOM_EVENTS, &labels, amount as f64)
        });
    }

    /// Record an error observed by some component.
    pub fn record_error(&self, component: &str, kind: &str) {
        self.track("record_error", || {
            let labels = [sanitize_label_value(component), sanitize_label_value(kind)];
            self.registry.inc_counter(series::ERRORS, &labels, 1.0)
        });
    }

    // ========== Push / Runtime Metrics ==========

    /// Record one push delivery attempt.
    pub fn record_push_attempt(&self, outcome: PushOutcome) {
        self.track("record_push_attempt", || {
            self.registry.inc_counter(
                series::PUSH_ATTEMPTS,
                &[outcome.as_str().to_string()],
                1.0,
            )
        });
    }

    /// Record buffered payloads dropped before delivery.
    pub fn record_push_dropped(&self, reason: DropReason, count: usize) {
        if count == 0 {
            return;
        }
        self.track("record_push_dropped", || {
            self.registry.inc_counter(
                series::PUSH_DROPPED,
                &[reason.as_str().to_string()],
                count as f64,
            )
        });
    }

    /// Set one of the runtime gauges.
    pub fn set_runtime_gauge(&self, gauge: RuntimeGauge, value: f64) {
        self.track("set_runtime_gauge", || {
            self.registry.set_gauge(gauge.series(), &[], value)
        });
    }

    /// Run a tracking operation, containing any failure.
    fn track<F>(&self, operation: &'static str, record: F)
    where
        F: FnOnce() -> Result<(), MetricsError>,
    {
        if !self.enabled {
            return;
        }

        if let Err(error) = record() {
            self.tracking_errors.fetch_add(1, Ordering::Relaxed);
            warn!(operation, error = %error, "Failed to record metric");
            if let Err(error) = self.registry.inc_counter(
                series::TRACKING_ERRORS,
                &[operation.to_string()],
                1.0,
            ) {
                trace!(error = %error, "Failed to count tracking error");
            }
        }
    }
}
