//! API response models.
//!
//! # Model Categories
//!
//! - **Probes**: readiness and liveness responses
//! - **Metrics**: series summary
//! - **Info**: build, process and feature information
//! - **Logging**: runtime log filter
//! - **Errors**: unmatched path response

use serde::{Deserialize, Serialize};

use crate::metrics::SeriesSummary;
use crate::push::PushStatus;

// ============================================================================
// Probes
// ============================================================================

/// Readiness probe response.
///
/// ```json
/// { "status": "not_ready", "timestamp": "...", "reason": "shutting down" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// `ready` or `not_ready`
    pub status: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveResponse {
    /// `alive` or `shutting_down`
    pub status: String,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
}

// ============================================================================
// Metrics
// ============================================================================

/// JSON overview of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub service: String,
    pub timestamp: String,
    pub total_series: usize,
    /// Sum of label combinations across all series
    pub total_samples: usize,
    pub series: Vec<SeriesSummary>,
}

// ============================================================================
// Info
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

/// Which optional features are switched on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub collection: bool,
    pub push: bool,
    pub auth: bool,
    pub cors: bool,
    pub debug: bool,
}

/// Service information response.
#[derive(Debug, Clone, Serialize)]
pub struct InfoResponse {
    pub service: String,
    pub version: String,
    /// Uptime in seconds
    pub uptime: u64,
    pub pid: Option<u32>,
    pub memory: MemoryInfo,
    pub features: FeatureFlags,
}

/// Internal state dump for operators.
#[derive(Debug, Clone, Serialize)]
pub struct DebugResponse {
    pub pending_operations: usize,
    pub shutting_down: bool,
    pub tracking_errors: u64,
    pub push: Option<PushStatus>,
    /// Active log filter directive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// Directory of the rolling log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

/// Request to replace the log filter.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    /// Filter directive, e.g. `beacon=debug,tower_http=warn`
    pub filter: String,
}

/// Current logging settings.
#[derive(Debug, Clone, Serialize)]
pub struct LogFilterResponse {
    pub filter: String,
    pub log_dir: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Body returned for unmatched paths.
#[derive(Debug, Clone, Serialize)]
pub struct NotFoundResponse {
    pub code: String,
    pub message: String,
    pub path: String,
    /// Enabled endpoint paths
    pub available: Vec<String>,
}
