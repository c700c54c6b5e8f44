//! Prometheus metrics exporter.
//!
//! Renders the registry in the Prometheus text exposition format (0.0.4).

use std::fmt::Write as _;
use std::sync::Arc;

use super::registry::{HistogramValue, MetricRegistry, SampleValue, SeriesDescriptor};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics exporter.
#[derive(Debug)]
pub struct PrometheusExporter {
    registry: Arc<MetricRegistry>,
    namespace: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the default namespace.
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self::with_namespace(registry, "beacon")
    }

    /// Create a new Prometheus exporter with custom namespace.
    ///
    /// An empty namespace leaves series names unprefixed.
    pub fn with_namespace(registry: Arc<MetricRegistry>, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully qualified name of a series.
    pub fn full_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let mut output = String::new();

        for series in self.registry.snapshot() {
            let full_name = self.full_name(&series.descriptor.name);
            self.write_header(&mut output, &full_name, &series.descriptor);

            for (values, sample) in &series.samples {
                let labels = self.label_pairs(&series.descriptor, values);
                match sample {
                    SampleValue::Counter(value) | SampleValue::Gauge(value) => {
                        self.write_sample(&mut output, &full_name, &labels, None, *value);
                    }
                    SampleValue::Histogram(histogram) => {
                        self.write_histogram(
                            &mut output,
                            &full_name,
                            &labels,
                            &series.descriptor.buckets,
                            histogram,
                        );
                    }
                }
            }
        }

        output
    }

    fn write_header(&self, output: &mut String, full_name: &str, descriptor: &SeriesDescriptor) {
        let _ = writeln!(output, "# HELP {} {}", full_name, escape_help(&descriptor.help));
        let _ = writeln!(output, "# TYPE {} {}", full_name, descriptor.kind);
    }

    fn label_pairs<'a>(
        &'a self,
        descriptor: &'a SeriesDescriptor,
        values: &'a [String],
    ) -> Vec<(&'a str, &'a str)> {
        self.registry
            .default_labels()
            .iter()
            .filter(|(name, _)| !descriptor.label_names.contains(name))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(
                descriptor
                    .label_names
                    .iter()
                    .zip(values)
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )
            .collect()
    }

    fn write_histogram(
        &self,
        output: &mut String,
        full_name: &str,
        labels: &[(&str, &str)],
        bounds: &[f64],
        histogram: &HistogramValue,
    ) {
        let bucket_name = format!("{}_bucket", full_name);
        for (bound, count) in bounds.iter().zip(&histogram.cumulative) {
            let le = format_value(*bound);
            self.write_sample(output, &bucket_name, labels, Some(&le), *count as f64);
        }
        self.write_sample(
            output,
            &bucket_name,
            labels,
            Some("+Inf"),
            histogram.count as f64,
        );
        self.write_sample(
            output,
            &format!("{}_sum", full_name),
            labels,
            None,
            histogram.sum,
        );
        self.write_sample(
            output,
            &format!("{}_count", full_name),
            labels,
            None,
            histogram.count as f64,
        );
    }

    fn write_sample(
        &self,
        output: &mut String,
        name: &str,
        labels: &[(&str, &str)],
        le: Option<&str>,
        value: f64,
    ) {
        let mut labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect::<Vec<_>>();
        if let Some(le) = le {
            labels_str.push(format!("le=\"{}\"", le));
        }

        if labels_str.is_empty() {
            let _ = writeln!(output, "{} {}", name, format_value(value));
        } else {
            let _ = writeln!(
                output,
                "{}{{{}}} {}",
                name,
                labels_str.join(","),
                format_value(value)
            );
        }
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
