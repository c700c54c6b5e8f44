//! Periodic runtime sampling.
//!
//! Refreshes process memory and CPU, uptime, pending operations and push
//! buffer depth into runtime gauges.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::collector::{MetricsCollector, RuntimeGauge};
use crate::lifecycle::Lifecycle;
use crate::push::PushDriver;

/// Memory and CPU of the current process.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_percent: f32,
}

pub struct RuntimeSampler {
    collector: Arc<MetricsCollector>,
    lifecycle: Arc<Lifecycle>,
    push: Option<Arc<dyn PushDriver>>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl RuntimeSampler {
    pub fn new(
        collector: Arc<MetricsCollector>,
        lifecycle: Arc<Lifecycle>,
        push: Option<Arc<dyn PushDriver>>,
    ) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                debug!(error, "Process statistics unavailable on this platform");
                None
            }
        };

        Self {
            collector,
            lifecycle,
            push,
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Current process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid.map(|pid| pid.as_u32())
    }

    /// Refresh and read memory and CPU of this process.
    pub fn process_stats(&self) -> ProcessStats {
        let Some(pid) = self.pid else {
            return ProcessStats::default();
        };

        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );

        system
            .process(pid)
            .map(|process| ProcessStats {
                resident_bytes: process.memory(),
                virtual_bytes: process.virtual_memory(),
                cpu_percent: process.cpu_usage(),
            })
            .unwrap_or_default()
    }

    /// Take one sample and publish it to the runtime gauges.
    pub fn sample(&self) -> ProcessStats {
        let stats = self.process_stats();
        let pending = self.lifecycle.pending_operations();
        let depth = self.push.as_ref().map_or(0, |push| push.buffer_depth());

        let gauges = [
            (RuntimeGauge::ResidentMemory, stats.resident_bytes as f64),
            (RuntimeGauge::VirtualMemory, stats.virtual_bytes as f64),
            (RuntimeGauge::CpuUsage, f64::from(stats.cpu_percent)),
            (RuntimeGauge::Uptime, self.lifecycle.uptime().as_secs_f64()),
            (RuntimeGauge::PendingOperations, pending as f64),
            (RuntimeGauge::PushBufferDepth, depth as f64),
        ];
        for (gauge, value) in gauges {
            self.collector.set_runtime_gauge(gauge, value);
        }

        trace!(
            resident_bytes = stats.resident_bytes,
            pending,
            buffer_depth = depth,
            "Runtime sample taken"
        );
        stats
    }

    /// Sample every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Runtime sampler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sample();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{LatencyThresholds, MetricRegistry, series};

    fn sampler() -> (RuntimeSampler, Arc<MetricRegistry>, Arc<Lifecycle>) {
        let registry = Arc::new(MetricRegistry::default());
        let collector = Arc::new(
            MetricsCollector::new(registry.clone(), true, LatencyThresholds::default()).unwrap(),
        );
        let lifecycle = Arc::new(Lifecycle::new());
        let sampler = RuntimeSampler::new(collector, lifecycle.clone(), None);
        (sampler, registry, lifecycle)
    }

    #[test]
    fn test_sample_sets_gauges() {
        let (sampler, registry, lifecycle) = sampler();
        let _a = lifecycle.begin_operation();
        let _b = lifecycle.begin_operation();

        sampler.sample();

        assert_eq!(registry.value(series::PENDING_OPERATIONS, &[]), Some(2.0));
        assert_eq!(registry.value(series::PUSH_BUFFER_DEPTH, &[]), Some(0.0));
        if sampler.pid().is_some() {
            assert!(registry.value(series::RESIDENT_MEMORY, &[]).unwrap_or(0.0) > 0.0);
        }
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let (sampler, registry, _) = sampler();
        let cancel = CancellationToken::new();
        let handle = Arc::new(sampler).spawn(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(registry.value(series::UPTIME, &[]).is_some());
    }
}
