//! Typed label sets and label value sanitization.
//!
//! Every label value that reaches the registry goes through
//! [`sanitize_label_value`]. Label sets are fixed structs per metric kind so
//! the label schema of each series is checked by the compiler.

use std::time::Duration;

use resilience::CircuitState;
use serde::Serialize;

/// Maximum length of a sanitized label value.
pub const MAX_LABEL_VALUE_LEN: usize = 100;

/// Replacement for values that sanitize to nothing.
const EMPTY_LABEL_VALUE: &str = "unknown";

/// Normalize a caller-supplied label value.
///
/// The result is lower-case, only contains `[a-z0-9_.-]` (anything else is
/// replaced by `_`), is at most [`MAX_LABEL_VALUE_LEN`] characters long, and
/// sanitizing it again returns it unchanged.
pub fn sanitize_label_value(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .take(MAX_LABEL_VALUE_LEN)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        EMPTY_LABEL_VALUE.to_string()
    } else {
        sanitized
    }
}

/// Coarse latency bucket used as a low-cardinality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedCategory {
    Fast,
    Normal,
    Slow,
}

impl SpeedCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedCategory::Fast => "fast",
            SpeedCategory::Normal => "normal",
            SpeedCategory::Slow => "slow",
        }
    }
}

/// Thresholds for [`SpeedCategory`].
#[derive(Debug, Clone, Copy)]
pub struct LatencyThresholds {
    /// Below this is `fast`.
    pub fast: Duration,
    /// At or above this is `slow`.
    pub slow: Duration,
}

impl LatencyThresholds {
    pub fn classify(&self, latency: Duration) -> SpeedCategory {
        if latency < self.fast {
            SpeedCategory::Fast
        } else if latency >= self.slow {
            SpeedCategory::Slow
        } else {
            SpeedCategory::Normal
        }
    }
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(100),
            slow: Duration::from_millis(1000),
        }
    }
}

/// How a message was handled by a responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Responded,
    Ignored,
    Failed,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Responded => "responded",
            MessageOutcome::Ignored => "ignored",
            MessageOutcome::Failed => "failed",
        }
    }
}

/// Labels of `messages_processed_total`.
#[derive(Debug, Clone, Copy)]
pub struct MessageLabels<'a> {
    pub trigger: &'a str,
    pub channel: &'a str,
    pub outcome: MessageOutcome,
}

impl MessageLabels<'_> {
    pub const NAMES: [&'static str; 3] = ["trigger", "channel", "outcome"];

    pub fn build(&self) -> [String; 3] {
        [
            sanitize_label_value(self.trigger),
            sanitize_label_value(self.channel),
            self.outcome.as_str().to_string(),
        ]
    }
}

/// Labels of `channel_activity_total`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLabels<'a> {
    pub channel: &'a str,
    pub activity: &'a str,
}

impl ChannelLabels<'_> {
    pub const NAMES: [&'static str; 2] = ["channel", "activity"];

    pub fn build(&self) -> [String; 2] {
        [
            sanitize_label_value(self.channel),
            sanitize_label_value(self.activity),
        ]
    }
}

/// Labels of `circuit_breaker_transitions_total`.
#[derive(Debug, Clone, Copy)]
pub struct BreakerLabels<'a> {
    pub dependency: &'a str,
    pub state: CircuitState,
}

impl BreakerLabels<'_> {
    pub const NAMES: [&'static str; 2] = ["dependency", "state"];

    pub fn build(&self) -> [String; 2] {
        [
            sanitize_label_value(self.dependency),
            self.state.as_str().to_string(),
        ]
    }
}

/// Labels of `http_requests_total`.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequestLabels<'a> {
    pub method: &'a str,
    pub route: &'a str,
    pub status: u16,
}

impl HttpRequestLabels<'_> {
    pub const NAMES: [&'static str; 3] = ["method", "route", "status"];

    pub fn build(&self) -> [String; 3] {
        [
            sanitize_label_value(self.method),
            sanitize_label_value(self.route),
            self.status.to_string(),
        ]
    }
}

/// Labels of `custom_events_total`.
#[derive(Debug, Clone, Copy)]
pub struct CustomEventLabels<'a> {
    pub domain: &'a str,
    pub event: &'a str,
}

impl CustomEventLabels<'_> {
    pub const NAMES: [&'static str; 2] = ["domain", "event"];

    pub fn build(&self) -> [String; 2] {
        [
            sanitize_label_value(self.domain),
            sanitize_label_value(self.event),
        ]
    }
}
