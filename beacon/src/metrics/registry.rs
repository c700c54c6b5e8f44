//! Metric registry.
//!
//! Holds every registered series and its samples. A series is identified by
//! its name; samples within a series are keyed by their ordered label values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::labels::sanitize_label_value;

/// Default histogram buckets for latencies, in seconds.
pub const DEFAULT_LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Kind of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("unknown series '{0}'")]
    UnknownSeries(String),

    #[error("series '{name}' is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: MetricKind,
        actual: MetricKind,
    },

    #[error("series '{name}' expects {expected} label values, got {got}")]
    LabelMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid value {value} for series '{name}'")]
    InvalidValue { name: String, value: f64 },

    #[error("series '{0}' is already registered with a different schema")]
    Conflict(String),

    #[error("invalid series definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}

/// Schema of a series: name, help text, kind, label names and buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    /// Upper bounds of histogram buckets, strictly increasing. Empty for
    /// counters and gauges.
    pub buckets: Vec<f64>,
}

impl SeriesDescriptor {
    pub fn counter(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::new(name, help, MetricKind::Counter, label_names, Vec::new())
    }

    pub fn gauge(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::new(name, help, MetricKind::Gauge, label_names, Vec::new())
    }

    pub fn histogram(name: &str, help: &str, label_names: &[&str], buckets: &[f64]) -> Self {
        Self::new(
            name,
            help,
            MetricKind::Histogram,
            label_names,
            buckets.to_vec(),
        )
    }

    fn new(
        name: &str,
        help: &str,
        kind: MetricKind,
        label_names: &[&str],
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            buckets,
        }
    }

    fn validate(&self) -> Result<(), MetricsError> {
        let invalid = |reason: &str| MetricsError::InvalidDefinition {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if !is_valid_metric_name(&self.name) {
            return Err(invalid("name must match [a-zA-Z_:][a-zA-Z0-9_:]*"));
        }

        for (i, label) in self.label_names.iter().enumerate() {
            if !is_valid_label_name(label) {
                return Err(invalid("label names must match [a-zA-Z_][a-zA-Z0-9_]*"));
            }
            if self.label_names[..i].contains(label) {
                return Err(invalid("duplicate label name"));
            }
        }

        match self.kind {
            MetricKind::Histogram => {
                if self.label_names.iter().any(|l| l == "le") {
                    return Err(invalid("'le' is reserved for histogram buckets"));
                }
                if self.buckets.is_empty() {
                    return Err(invalid("histogram needs at least one bucket"));
                }
                if self.buckets.iter().any(|b| !b.is_finite())
                    || self.buckets.windows(2).any(|w| w[0] >= w[1])
                {
                    return Err(invalid("buckets must be finite and strictly increasing"));
                }
            }
            MetricKind::Counter | MetricKind::Gauge => {
                if !self.buckets.is_empty() {
                    return Err(invalid("only histograms take buckets"));
                }
            }
        }

        Ok(())
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Accumulated histogram observations.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    /// Cumulative count per bucket, aligned with the descriptor's buckets.
    pub cumulative: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramValue {
    fn new(buckets: usize) -> Self {
        Self {
            cumulative: vec![0; buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        for (slot, bound) in self.cumulative.iter_mut().zip(bounds) {
            if value <= *bound {
                *slot += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Current value of one labelled sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramValue),
}

/// Point-in-time copy of one series.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub descriptor: SeriesDescriptor,
    pub samples: Vec<(Vec<String>, SampleValue)>,
}

/// Per-series summary for the JSON summary endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub help: String,
    pub labels: Vec<String>,
    pub cardinality: usize,
}

#[derive(Debug)]
struct Series {
    descriptor: SeriesDescriptor,
    samples: Mutex<BTreeMap<Vec<String>, SampleValue>>,
}

/// Registry of metric series.
///
/// Registration is idempotent for identical descriptors. Writes lock only
/// the series they touch.
#[derive(Debug)]
pub struct MetricRegistry {
    series: DashMap<String, Arc<Series>>,
    default_labels: Vec<(String, String)>,
}

impl MetricRegistry {
    /// Create a registry. Default label values are sanitized here and
    /// attached to every sample at exposition time.
    pub fn new(default_labels: Vec<(String, String)>) -> Self {
        let default_labels = default_labels
            .into_iter()
            .filter(|(name, _)| is_valid_label_name(name))
            .map(|(name, value)| {
                let value = sanitize_label_value(&value);
                (name, value)
            })
            .collect();

        Self {
            series: DashMap::new(),
            default_labels,
        }
    }

    pub fn default_labels(&self) -> &[(String, String)] {
        &self.default_labels
    }

    /// Register a series.
    ///
    /// Registering an identical descriptor again is a no-op; a different
    /// descriptor under an existing name is a [`MetricsError::Conflict`].
    pub fn register(&self, descriptor: SeriesDescriptor) -> Result<(), MetricsError> {
        descriptor.validate()?;

        if let Some(existing) = self.series.get(&descriptor.name) {
            return if existing.descriptor == descriptor {
                Ok(())
            } else {
                Err(MetricsError::Conflict(descriptor.name))
            };
        }

        let name = descriptor.name.clone();
        let mut samples = BTreeMap::new();
        if descriptor.label_names.is_empty() {
            // Unlabelled counters and gauges are exposed from the start.
            match descriptor.kind {
                MetricKind::Counter => {
                    samples.insert(Vec::new(), SampleValue::Counter(0.0));
                }
                MetricKind::Gauge => {
                    samples.insert(Vec::new(), SampleValue::Gauge(0.0));
                }
                MetricKind::Histogram => {}
            }
        }

        let entry = self.series.entry(name.clone()).or_insert_with(|| {
            Arc::new(Series {
                descriptor: descriptor.clone(),
                samples: Mutex::new(samples),
            })
        });
        if entry.descriptor != descriptor {
            return Err(MetricsError::Conflict(name));
        }

        debug!(series = %name, "Registered metric series");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    /// Number of registered series.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Add `amount` to a counter.
    pub fn inc_counter(
        &self,
        name: &str,
        labels: &[String],
        amount: f64,
    ) -> Result<(), MetricsError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(MetricsError::InvalidValue {
                name: name.to_string(),
                value: amount,
            });
        }

        let series = self.lookup(name, MetricKind::Counter, labels)?;
        let mut samples = series.samples.lock();
        match samples.get_mut(labels) {
            Some(SampleValue::Counter(value)) => *value += amount,
            _ => {
                samples.insert(labels.to_vec(), SampleValue::Counter(amount));
            }
        }
        Ok(())
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, labels: &[String], value: f64) -> Result<(), MetricsError> {
        self.update_gauge(name, labels, value, |_, new| new)
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn add_gauge(&self, name: &str, labels: &[String], delta: f64) -> Result<(), MetricsError> {
        self.update_gauge(name, labels, delta, |current, delta| current + delta)
    }

    fn update_gauge(
        &self,
        name: &str,
        labels: &[String],
        value: f64,
        apply: impl Fn(f64, f64) -> f64,
    ) -> Result<(), MetricsError> {
        if !value.is_finite() {
            return Err(MetricsError::InvalidValue {
                name: name.to_string(),
                value,
            });
        }

        let series = self.lookup(name, MetricKind::Gauge, labels)?;
        let mut samples = series.samples.lock();
        match samples.get_mut(labels) {
            Some(SampleValue::Gauge(current)) => *current = apply(*current, value),
            _ => {
                samples.insert(labels.to_vec(), SampleValue::Gauge(apply(0.0, value)));
            }
        }
        Ok(())
    }

    /// Record one histogram observation.
    pub fn observe(&self, name: &str, labels: &[String], value: f64) -> Result<(), MetricsError> {
        if !value.is_finite() || value < 0.0 {
            return Err(MetricsError::InvalidValue {
                name: name.to_string(),
                value,
            });
        }

        let series = self.lookup(name, MetricKind::Histogram, labels)?;
        let bounds = &series.descriptor.buckets;
        let mut samples = series.samples.lock();
        let sample = samples
            .entry(labels.to_vec())
            .or_insert_with(|| SampleValue::Histogram(HistogramValue::new(bounds.len())));
        if let SampleValue::Histogram(histogram) = sample {
            histogram.observe(bounds, value);
        }
        Ok(())
    }

    fn lookup(
        &self,
        name: &str,
        kind: MetricKind,
        labels: &[String],
    ) -> Result<Arc<Series>, MetricsError> {
        let series = self
            .series
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MetricsError::UnknownSeries(name.to_string()))?;

        if series.descriptor.kind != kind {
            return Err(MetricsError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                actual: series.descriptor.kind,
            });
        }
        if series.descriptor.label_names.len() != labels.len() {
            return Err(MetricsError::LabelMismatch {
                name: name.to_string(),
                expected: series.descriptor.label_names.len(),
                got: labels.len(),
            });
        }

        Ok(series)
    }

    /// Copy every series, ordered by name.
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let series: Vec<Arc<Series>> = self
            .series
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots: Vec<SeriesSnapshot> = series
            .iter()
            .map(|series| SeriesSnapshot {
                descriptor: series.descriptor.clone(),
                samples: series
                    .samples
                    .lock()
                    .iter()
                    .map(|(labels, value)| (labels.clone(), value.clone()))
                    .collect(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        snapshots
    }

    /// Summaries of every series, ordered by name.
    pub fn summary(&self) -> Vec<SeriesSummary> {
        self.snapshot()
            .into_iter()
            .map(|snapshot| SeriesSummary {
                cardinality: snapshot.samples.len(),
                name: snapshot.descriptor.name,
                kind: snapshot.descriptor.kind,
                help: snapshot.descriptor.help,
                labels: snapshot.descriptor.label_names,
            })
            .collect()
    }

    /// Value of a counter or gauge sample, mainly for assertions and checks.
    pub fn value(&self, name: &str, labels: &[String]) -> Option<f64> {
        let series = self.series.get(name).map(|e| Arc::clone(e.value()))?;
        let samples = series.samples.lock();
        match samples.get(labels)? {
            SampleValue::Counter(v) | SampleValue::Gauge(v) => Some(*v),
            SampleValue::Histogram(h) => Some(h.count as f64),
        }
    }

    /// Number of distinct values of one label across a series' samples.
    pub fn distinct_label_values(&self, name: &str, label: usize) -> Result<usize, MetricsError> {
        let series = self
            .series
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| MetricsError::UnknownSeries(name.to_string()))?;
        let samples = series.samples.lock();
        let distinct: BTreeSet<&str> = samples
            .keys()
            .filter_map(|labels| labels.get(label).map(String::as_str))
            .collect();
        Ok(distinct.len())
    }

    /// Drop every sample while keeping the registered series.
    pub fn clear(&self) {
        for entry in self.series.iter() {
            entry.value().samples.lock().clear();
        }
        debug!("Metric registry cleared");
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
