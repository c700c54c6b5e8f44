//! Telemetry service handle.
//!
//! `TelemetryService::init` builds every component from one configuration
//! snapshot, registers the default health checks and starts the background
//! tasks. `shutdown` on the same handle tears everything down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::checks::{PushGatewayCheck, RegistryCheck, TrackingErrorsCheck};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{DrainOutcome, Lifecycle, OperationGuard};
use crate::metrics::{
    HealthAggregator, LatencyThresholds, MetricRegistry, MetricsCollector, PrometheusExporter,
    RuntimeSampler,
};
use crate::push::{HttpPushTransport, PipelineSettings, PushDriver, PushPipeline, PushTransport};

/// Poll period while waiting for pending operations.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed for background tasks to exit once cancelled.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of the final push flush during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalFlush {
    /// Push is disabled.
    Skipped,
    Sent(usize),
    Failed { sent: usize, requeued: usize },
}

/// What happened during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Shutdown had already run; nothing was done.
    pub already_shut_down: bool,
    /// The drain deadline passed with operations still pending.
    pub forced: bool,
    pub pending_at_deadline: usize,
    pub final_flush: FinalFlush,
    pub pool_drained: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    fn already_shut_down() -> Self {
        Self {
            already_shut_down: true,
            forced: false,
            pending_at_deadline: 0,
            final_flush: FinalFlush::Skipped,
            pool_drained: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Handle on a running telemetry pipeline.
pub struct TelemetryService {
    config: ServiceConfig,
    registry: Arc<MetricRegistry>,
    exporter: Arc<PrometheusExporter>,
    collector: Arc<MetricsCollector>,
    health: Arc<HealthAggregator>,
    sampler: Arc<RuntimeSampler>,
    push: Option<Arc<dyn PushDriver>>,
    lifecycle: Arc<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryService {
    /// Build and start the service. Pushes over HTTP when push is enabled.
    pub async fn init(config: ServiceConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let transport = if config.push.enabled {
            let gateway = config
                .push
                .gateway_url
                .as_deref()
                .ok_or_else(|| Error::config("push enabled without a gateway URL"))?;
            Some(HttpPushTransport::new(
                gateway,
                &config.service_name,
                config.push.timeout,
            ))
        } else {
            None
        };

        Self::start(config, transport)
    }

    /// Build and start the service, pushing through `transport`.
    ///
    /// Push is on regardless of `config.push.enabled`; the other push
    /// settings still apply.
    pub async fn init_with_transport<T: PushTransport>(
        mut config: ServiceConfig,
        transport: T,
    ) -> Result<Arc<Self>> {
        config.push.enabled = false;
        config.validate()?;
        config.push.enabled = true;

        Self::start(config, Some(transport))
    }

    fn start<T: PushTransport>(config: ServiceConfig, transport: Option<T>) -> Result<Arc<Self>> {
        info!(service = %config.service_name, "Initializing telemetry service");

        let lifecycle = Arc::new(Lifecycle::new());
        let registry = Arc::new(MetricRegistry::new(config.metrics.default_labels.clone()));
        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&registry),
            config.metrics.enabled,
            LatencyThresholds {
                fast: config.metrics.latency_fast,
                slow: config.metrics.latency_slow,
            },
        )?);
        let exporter = Arc::new(PrometheusExporter::with_namespace(
            Arc::clone(&registry),
            config.metrics.namespace.clone(),
        ));

        let push: Option<Arc<dyn PushDriver>> = transport.map(|transport| {
            let pipeline = PushPipeline::new(
                PipelineSettings::from(&config.push),
                transport,
                Arc::clone(&exporter),
                Arc::clone(&collector),
                Arc::clone(&lifecycle),
            );
            Arc::new(pipeline) as Arc<dyn PushDriver>
        });

        let health = Arc::new(HealthAggregator::with_timeout(
            config.service_name.clone(),
            config.metrics.health_timeout,
        ));
        health.register("registry", Arc::new(RegistryCheck::new(Arc::clone(&collector))));
        health.register(
            "tracking_errors",
            Arc::new(TrackingErrorsCheck::new(Arc::clone(&collector))),
        );
        if let Some(push) = &push {
            health.register("push_gateway", Arc::new(PushGatewayCheck::new(Arc::clone(push))));
        }

        let sampler = Arc::new(RuntimeSampler::new(
            Arc::clone(&collector),
            Arc::clone(&lifecycle),
            push.clone(),
        ));

        let service = Arc::new(Self {
            config,
            registry,
            exporter,
            collector,
            health,
            sampler,
            push,
            lifecycle,
            tasks: Mutex::new(Vec::new()),
        });
        service.spawn_background_tasks();

        info!(
            service = %service.config.service_name,
            push = service.push.is_some(),
            collection = service.config.metrics.enabled,
            "Telemetry service initialized"
        );
        Ok(service)
    }

    fn spawn_background_tasks(&self) {
        let cancel = self.lifecycle.cancel_token();
        let mut tasks = self.tasks.lock();

        if self.config.metrics.enabled {
            tasks.push(
                Arc::clone(&self.sampler)
                    .spawn(self.config.metrics.sample_interval, cancel.clone()),
            );
        }

        if let Some(push) = &self.push {
            tasks.push(spawn_push_loop(
                Arc::clone(push),
                self.config.push.interval,
                cancel.clone(),
            ));
            tasks.push(spawn_cleanup_loop(
                Arc::clone(push),
                self.config.cleanup_interval,
                cancel,
            ));
        }

        debug!(count = tasks.len(), "Background tasks started");
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn exporter(&self) -> &Arc<PrometheusExporter> {
        &self.exporter
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn sampler(&self) -> &Arc<RuntimeSampler> {
        &self.sampler
    }

    pub fn push(&self) -> Option<&Arc<dyn PushDriver>> {
        self.push.as_ref()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Count an in-flight operation that shutdown should wait for.
    pub fn begin_operation(&self) -> OperationGuard {
        self.lifecycle.begin_operation()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Shut down with the configured drain budget.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_timeout(self.config.shutdown_timeout)
            .await
    }

    /// Shut down, waiting at most `timeout` for pending operations.
    ///
    /// A second call returns immediately.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> ShutdownReport {
        if !self.lifecycle.begin_shutdown() {
            debug!("Shutdown already performed");
            return ShutdownReport::already_shut_down();
        }

        let started = Instant::now();
        info!(timeout = ?timeout, "Shutting down telemetry service");

        let (forced, pending_at_deadline) = match self
            .lifecycle
            .wait_for_idle(timeout, SHUTDOWN_POLL_INTERVAL)
            .await
        {
            DrainOutcome::Drained => (false, 0),
            DrainOutcome::TimedOut { pending } => {
                warn!(
                    pending,
                    "Shutdown timeout reached with pending operations, forcing shutdown"
                );
                (true, pending)
            }
        };

        let final_flush = match &self.push {
            Some(push) => match push.flush().await {
                Ok(sent) => {
                    info!(sent, "Final push flush complete");
                    FinalFlush::Sent(sent)
                }
                Err(e) => {
                    warn!(error = %e, "Final push flush failed");
                    FinalFlush::Failed {
                        sent: e.sent,
                        requeued: e.requeued,
                    }
                }
            },
            None => FinalFlush::Skipped,
        };

        let pool_drained = self.push.as_ref().map_or(0, |push| push.drain_pool());
        self.registry.clear();
        self.join_tasks().await;

        let report = ShutdownReport {
            already_shut_down: false,
            forced,
            pending_at_deadline,
            final_flush,
            pool_drained,
            elapsed: started.elapsed(),
        };
        info!(elapsed = ?report.elapsed, forced, "Telemetry service shut down");
        report
    }

    async fn join_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        if tokio::time::timeout(TASK_JOIN_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl std::fmt::Debug for TelemetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryService")
            .field("service", &self.config.service_name)
            .field("push", &self.push.is_some())
            .field("shutting_down", &self.lifecycle.is_shutting_down())
            .finish()
    }
}

fn spawn_push_loop(
    push: Arc<dyn PushDriver>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Push loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match push.run_cycle().await {
                        Ok(outcome) => trace!(?outcome, "Push cycle complete"),
                        Err(e) => debug!(error = %e, "Push cycle ended with requeued payloads"),
                    }
                }
            }
        }
    })
}

fn spawn_cleanup_loop(
    push: Arc<dyn PushDriver>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cleanup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = push.evict_stale();
                    if evicted.buffer_entries > 0 || evicted.idle_connections > 0 {
                        debug!(
                            buffer_entries = evicted.buffer_entries,
                            idle_connections = evicted.idle_connections,
                            "Stale push state cleaned up"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CheckStatus;
    use crate::push::{CycleOutcome, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct RecordingTransport {
        sent: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: Arc::new(AtomicUsize::new(0)),
                failing: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        type Connection = ();

        fn name(&self) -> &str {
            "push_gateway"
        }

        fn connect(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _: &(), _: &str) -> std::result::Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Status {
                    status: 502,
                    body: String::new(),
                });
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn push_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.push.interval = Duration::from_secs(3600);
        config.push.breaker_failure_threshold = 1;
        config
    }

    #[tokio::test]
    async fn test_init_without_push() {
        let service = TelemetryService::init(ServiceConfig::default()).await.unwrap();
        assert!(service.push().is_none());
        assert_eq!(
            service.health().names(),
            vec!["registry".to_string(), "tracking_errors".to_string()]
        );

        let report = service.health().run_all().await;
        assert!(report.is_healthy());

        let report = service.shutdown().await;
        assert!(!report.forced);
        assert_eq!(report.final_flush, FinalFlush::Skipped);
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let mut config = ServiceConfig::default();
        config.push.enabled = true;
        assert!(matches!(
            TelemetryService::init(config).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_forced_after_deadline() {
        let service = TelemetryService::init(ServiceConfig::default()).await.unwrap();
        let _first = service.begin_operation();
        let _second = service.begin_operation();

        let started = Instant::now();
        let report = service
            .shutdown_with_timeout(Duration::from_secs(10))
            .await;

        assert!(report.forced);
        assert_eq!(report.pending_at_deadline, 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert!(service.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_pending_operations() {
        let service = TelemetryService::init(ServiceConfig::default()).await.unwrap();
        let guard = service.begin_operation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            drop(guard);
        });

        let report = service.shutdown().await;
        assert!(!report.forced);
        assert!(report.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let service = TelemetryService::init(ServiceConfig::default()).await.unwrap();
        assert!(!service.shutdown().await.already_shut_down);
        assert!(service.shutdown().await.already_shut_down);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer_and_clears_registry() {
        let transport = RecordingTransport::new();
        let sent = transport.sent.clone();
        let mut config = push_config();
        config.push.flush_interval = Some(Duration::from_secs(3600));
        let service = TelemetryService::init_with_transport(config, transport)
            .await
            .unwrap();

        service.collector().increment_custom("notes", "created", 1);
        let push = service.push().unwrap();
        assert!(matches!(
            push.run_cycle().await,
            Ok(CycleOutcome::Buffered { depth: 1 })
        ));
        assert!(matches!(
            push.run_cycle().await,
            Ok(CycleOutcome::Buffered { depth: 2 })
        ));

        let report = service.shutdown().await;
        assert_eq!(report.final_flush, FinalFlush::Sent(2));
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert!(
            service
                .registry()
                .summary()
                .iter()
                .all(|series| series.cardinality == 0)
        );
    }

    #[tokio::test]
    async fn test_push_gateway_check_follows_breaker() {
        let transport = RecordingTransport::new();
        let failing = transport.failing.clone();
        let service = TelemetryService::init_with_transport(push_config(), transport)
            .await
            .unwrap();
        let push = service.push().unwrap();

        let check = |report: &crate::metrics::HealthReport| {
            report
                .checks
                .iter()
                .find(|c| c.name == "push_gateway")
                .map(|c| c.status)
        };

        let report = service.health().run_all().await;
        assert_eq!(check(&report), Some(CheckStatus::Pass));

        failing.store(true, Ordering::SeqCst);
        assert!(push.run_cycle().await.is_err());

        let report = service.health().run_all().await;
        assert_eq!(check(&report), Some(CheckStatus::Warn));
        assert!(!service.health().check_ready(false).await.ready);

        service.shutdown().await;
    }
}
