//! Service wiring.
//!
//! [`TelemetryService`] owns every telemetry component and the background
//! tasks that drive them. [`checks`] holds the built-in health checks it
//! registers at startup.

pub mod checks;
pub mod container;

pub use container::{FinalFlush, ShutdownReport, TelemetryService};
