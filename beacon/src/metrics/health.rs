//! Health check implementation.
//!
//! Runs registered probes concurrently, each under its own timeout, and
//! folds their results into one overall status.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default time budget of a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result status of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// At least one check warned, none failed.
    Degraded,
    /// At least one check failed.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What a probe reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub output: String,
}

impl ProbeOutcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            output: output.into(),
        }
    }

    pub fn warn(output: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            output: output.into(),
        }
    }
}

/// A named health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn probe(&self) -> anyhow::Result<ProbeOutcome>;
}

struct FnCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send + 'static,
{
    async fn probe(&self) -> anyhow::Result<ProbeOutcome> {
        (self.0)().await
    }
}

/// Result of one check within a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub output: String,
    /// Start time of the probe (RFC 3339).
    pub time: String,
    pub duration_ms: u64,
}

/// Overall system health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    /// Timestamp of the health check.
    pub timestamp: String,
    pub service: String,
    /// Uptime in seconds.
    pub uptime: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Readiness verdict.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub reason: Option<String>,
}

/// Fold check statuses: any fail is unhealthy, any warn is degraded.
pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a CheckStatus>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            CheckStatus::Fail => return HealthStatus::Unhealthy,
            CheckStatus::Warn => overall = HealthStatus::Degraded,
            CheckStatus::Pass => {}
        }
    }
    overall
}

/// Health aggregator for the service.
pub struct HealthAggregator {
    checks: parking_lot::RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>,
    probe_timeout: Duration,
    service: String,
    start_time: Instant,
}

impl HealthAggregator {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_timeout(service, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(service: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            checks: parking_lot::RwLock::new(BTreeMap::new()),
            probe_timeout,
            service: service.into(),
            start_time: Instant::now(),
        }
    }

    /// Register a health check. A check with the same name is replaced.
    pub fn register(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let name = name.into();
        debug!(check = %name, "Registered health check");
        self.checks.write().insert(name, check);
    }

    /// Register an async closure as a health check.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send + 'static,
    {
        self.register(name, Arc::new(FnCheck(probe)));
    }

    /// Unregister a health check.
    ///
    /// Returns true if the check was removed, false if it didn't exist.
    pub fn unregister(&self, name: &str) -> bool {
        self.checks.write().remove(name).is_some()
    }

    /// Names of registered checks, sorted.
    pub fn names(&self) -> Vec<String> {
        self.checks.read().keys().cloned().collect()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Run all health checks concurrently.
    pub async fn run_all(&self) -> HealthReport {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .read()
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();

        let probe_timeout = self.probe_timeout;
        let checks = futures::future::join_all(
            checks
                .into_iter()
                .map(|(name, check)| run_probe(name, check, probe_timeout)),
        )
        .await;

        let status = aggregate(checks.iter().map(|c| &c.status));
        if status != HealthStatus::Healthy {
            debug!(%status, "Health checks not all passing");
        }

        HealthReport {
            status,
            checks,
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: self.service.clone(),
            uptime: self.uptime().as_secs(),
        }
    }

    /// Readiness: healthy and not shutting down.
    ///
    /// Probes are skipped once shutdown has begun.
    pub async fn check_ready(&self, shutting_down: bool) -> Readiness {
        if shutting_down {
            return Readiness {
                ready: false,
                reason: Some("shutting down".to_string()),
            };
        }

        let report = self.run_all().await;
        if report.is_healthy() {
            return Readiness {
                ready: true,
                reason: None,
            };
        }

        let failing = report
            .checks
            .iter()
            .filter(|c| c.status != CheckStatus::Pass)
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Readiness {
            ready: false,
            reason: Some(format!("{}: {}", report.status, failing)),
        }
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("service", &self.service)
            .field("checks", &self.names())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

async fn run_probe(name: String, check: Arc<dyn HealthCheck>, timeout: Duration) -> CheckResult {
    let time = chrono::Utc::now().to_rfc3339();
    let started = Instant::now();

    let mut task = tokio::spawn(async move { check.probe().await });
    let mut outcome = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(error))) => ProbeOutcome::fail(format!("check failed: {:#}", error)),
        Ok(Err(join_error)) if join_error.is_panic() => ProbeOutcome::fail("check panicked"),
        Ok(Err(join_error)) => ProbeOutcome::fail(format!("check aborted: {}", join_error)),
        Err(_) => {
            task.abort();
            ProbeOutcome::fail(format!("check timed out after {}ms", timeout.as_millis()))
        }
    };

    if outcome.output.is_empty() && outcome.status != CheckStatus::Pass {
        outcome.output = outcome.status.as_str().to_string();
    }
    if outcome.status == CheckStatus::Fail {
        warn!(check = %name, output = %outcome.output, "Health check failed");
    }

    CheckResult {
        name,
        status: outcome.status,
        output: outcome.output,
        time,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        use CheckStatus::*;
        assert_eq!(aggregate(&[] as &[CheckStatus]), HealthStatus::Healthy);
        assert_eq!(aggregate(&[Pass, Pass]), HealthStatus::Healthy);
        assert_eq!(aggregate(&[Pass, Warn]), HealthStatus::Degraded);
        assert_eq!(aggregate(&[Warn, Fail, Pass]), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_empty_aggregator_is_healthy() {
        let health = HealthAggregator::new("svc");
        let report = health.run_all().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.checks.is_empty());
        assert_eq!(report.service, "svc");
    }

    #[tokio::test]
    async fn test_register_replace_unregister() {
        let health = HealthAggregator::new("svc");
        health.register_fn("db", || async { Ok(ProbeOutcome::fail("down")) });
        health.register_fn("db", || async { Ok(ProbeOutcome::pass("up")) });
        health.register_fn("cache", || async { Ok(ProbeOutcome::warn("slow")) });
        assert_eq!(health.names(), vec!["cache", "db"]);

        let report = health.run_all().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks[1].output, "up");

        assert!(health.unregister("cache"));
        assert!(!health.unregister("cache"));
        assert_eq!(health.run_all().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_error_and_panic_become_fail() {
        let health = HealthAggregator::new("svc");
        health.register_fn("errors", || async { Err(anyhow::anyhow!("connection refused")) });
        health.register_fn("panics", || async {
            if true {
                panic!("probe exploded");
            }
            Ok(ProbeOutcome::pass(""))
        });

        let report = health.run_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        for check in &report.checks {
            assert_eq!(check.status, CheckStatus::Fail);
            assert!(!check.output.is_empty());
        }
        assert!(report.checks[0].output.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let health = HealthAggregator::with_timeout("svc", Duration::from_secs(5));
        health.register_fn("hangs", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProbeOutcome::pass("never"))
        });
        health.register_fn("quick", || async { Ok(ProbeOutcome::pass("ok")) });

        let report = health.run_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);

        let hanging = &report.checks[0];
        assert_eq!(hanging.name, "hangs");
        assert_eq!(hanging.status, CheckStatus::Fail);
        assert!(hanging.output.contains("timed out"));
        assert_eq!(report.checks[1].status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn test_readiness() {
        let health = HealthAggregator::new("svc");
        assert!(health.check_ready(false).await.ready);

        let readiness = health.check_ready(true).await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("shutting down"));

        health.register_fn("push", || async { Ok(ProbeOutcome::warn("breaker open")) });
        let readiness = health.check_ready(false).await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("degraded: push"));
    }
}
