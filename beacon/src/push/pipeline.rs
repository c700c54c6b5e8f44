//! Buffered push pipeline.
//!
//! Each cycle renders the registry into one exposition payload and appends
//! it to a bounded buffer. Flushes deliver the buffer in order through the
//! circuit breaker. An entry leaves the buffer only after its delivery is
//! confirmed, so a failed or cancelled flush keeps the unsent remainder at
//! the head and nothing confirmed is sent twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience::{BreakerConfig, BreakerError, CircuitBreaker, PoolError, ResourcePool};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{PushTransport, TransportError};
use super::{PushDriver, PushStatus};
use crate::config::PushConfig;
use crate::lifecycle::Lifecycle;
use crate::metrics::{DropReason, MetricsCollector, PrometheusExporter, PushOutcome};

/// One serialized snapshot waiting for delivery.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub timestamp: DateTime<Utc>,
    pub payload: String,
    enqueued_at: Instant,
    /// Position in enqueue order, unique per pipeline.
    seq: u64,
}

impl BufferEntry {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            payload: payload.into(),
            enqueued_at: Instant::now(),
            seq: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// What the pipeline is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPhase {
    Idle,
    Serializing,
    Buffering,
    Flushing,
}

/// Result of one push cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Shutdown has begun; nothing was done.
    Skipped,
    /// The snapshot was buffered; no flush was due.
    Buffered { depth: usize },
    /// The buffer was flushed.
    Flushed { sent: usize },
}

/// A flush stopped at a failed delivery.
#[derive(Debug, thiserror::Error)]
#[error("push flush stopped after {sent} deliveries with {requeued} requeued: {source}")]
pub struct FlushError {
    pub sent: usize,
    pub requeued: usize,
    #[source]
    pub source: BreakerError<TransportError>,
}

/// Entries removed by the cleanup task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleEviction {
    pub buffer_entries: usize,
    pub idle_connections: usize,
}

/// Buffering settings of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_batch_size: usize,
    pub max_buffer_entries: usize,
    pub buffer_max_age: Duration,
    /// `None` flushes on every cycle.
    pub flush_interval: Option<Duration>,
    pub pool_size: usize,
    pub pool_idle_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl From<&PushConfig> for PipelineSettings {
    fn from(config: &PushConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_buffer_entries: config.max_buffer_entries,
            buffer_max_age: config.buffer_max_age,
            flush_interval: config.flush_interval,
            pool_size: config.pool_size,
            pool_idle_timeout: config.pool_idle_timeout,
            breaker: BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                cooldown: config.breaker_cooldown,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Delivery {
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    sent_total: u64,
    dropped_total: u64,
}

pub struct PushPipeline<T: PushTransport> {
    settings: PipelineSettings,
    transport: Arc<T>,
    exporter: Arc<PrometheusExporter>,
    collector: Arc<MetricsCollector>,
    lifecycle: Arc<Lifecycle>,
    breaker: CircuitBreaker,
    pool: ResourcePool<T::Connection>,
    buffer: Mutex<VecDeque<BufferEntry>>,
    phase: Mutex<PushPhase>,
    last_flush: Mutex<Instant>,
    delivery: Mutex<Delivery>,
    flush_lock: tokio::sync::Mutex<()>,
    next_seq: AtomicU64,
}

impl<T: PushTransport> PushPipeline<T> {
    pub fn new(
        settings: PipelineSettings,
        transport: T,
        exporter: Arc<PrometheusExporter>,
        collector: Arc<MetricsCollector>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let transport = Arc::new(transport);
        let name = transport.name().to_string();

        let breaker = CircuitBreaker::new(name.clone(), settings.breaker.clone());
        let observer = Arc::clone(&collector);
        breaker.on_transition(Arc::new(move |dependency, state| {
            observer.record_circuit_breaker_activation(dependency, state);
        }));

        let factory = Arc::clone(&transport);
        let pool = ResourcePool::new(name, settings.pool_size, move || factory.connect());

        Self {
            settings,
            transport,
            exporter,
            collector,
            lifecycle,
            breaker,
            pool,
            buffer: Mutex::new(VecDeque::new()),
            phase: Mutex::new(PushPhase::Idle),
            last_flush: Mutex::new(Instant::now()),
            delivery: Mutex::new(Delivery::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool(&self) -> &ResourcePool<T::Connection> {
        &self.pool
    }

    /// Copy of the buffered entries, oldest first.
    pub fn buffered(&self) -> Vec<BufferEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    fn set_phase(&self, phase: PushPhase) {
        *self.phase.lock() = phase;
    }

    /// Serialize the registry, buffer the snapshot, and flush if due.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, FlushError> {
        if self.lifecycle.is_shutting_down() {
            debug!("Skipping push cycle during shutdown");
            return Ok(CycleOutcome::Skipped);
        }

        self.set_phase(PushPhase::Serializing);
        let payload = self.exporter.export();

        self.set_phase(PushPhase::Buffering);
        let depth = self.enqueue(payload);

        if depth < self.settings.max_batch_size && !self.flush_timer_due() {
            self.set_phase(PushPhase::Idle);
            return Ok(CycleOutcome::Buffered { depth });
        }

        let sent = self.flush().await?;
        Ok(CycleOutcome::Flushed { sent })
    }

    fn flush_timer_due(&self) -> bool {
        match self.settings.flush_interval {
            None => true,
            Some(interval) => self.last_flush.lock().elapsed() >= interval,
        }
    }

    /// Append a payload, dropping the oldest entries beyond the cap.
    ///
    /// Returns the buffer depth afterwards.
    pub fn enqueue(&self, payload: impl Into<String>) -> usize {
        let (depth, dropped) = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(BufferEntry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                ..BufferEntry::new(payload)
            });
            let dropped = self.enforce_cap(&mut buffer);
            (buffer.len(), dropped)
        };
        self.note_dropped(DropReason::Overflow, dropped);
        depth
    }

    fn enforce_cap(&self, buffer: &mut VecDeque<BufferEntry>) -> usize {
        let excess = buffer
            .len()
            .saturating_sub(self.settings.max_buffer_entries);
        buffer.drain(..excess);
        excess
    }

    fn note_dropped(&self, reason: DropReason, count: usize) {
        if count == 0 {
            return;
        }
        self.delivery.lock().dropped_total += count as u64;
        warn!(
            count,
            reason = ?reason,
            "Dropped buffered push payloads"
        );
        self.collector.record_push_dropped(reason, count);
    }

    /// Deliver every buffered entry in order.
    ///
    /// Only one flush runs at a time; a concurrent caller waits its turn.
    /// Entries enqueued while a flush runs wait for the next one.
    pub async fn flush(&self) -> Result<usize, FlushError> {
        let _flushing = self.flush_lock.lock().await;
        let _operation = self.lifecycle.begin_operation();

        *self.last_flush.lock() = Instant::now();
        let Some(last_seq) = self.buffer.lock().back().map(|entry| entry.seq) else {
            self.set_phase(PushPhase::Idle);
            return Ok(0);
        };

        self.set_phase(PushPhase::Flushing);
        let mut sent = 0;

        while let Some(entry) = self.next_in_batch(last_seq) {
            match self.deliver(&entry).await {
                Ok(()) => {
                    self.confirm(entry.seq);
                    sent += 1;
                    self.collector.record_push_attempt(PushOutcome::Success);
                }
                Err(source) => {
                    let outcome = if source.is_open() {
                        PushOutcome::Rejected
                    } else {
                        PushOutcome::Failure
                    };
                    self.collector.record_push_attempt(outcome);

                    let requeued = self.remaining_in_batch(last_seq);
                    {
                        let mut delivery = self.delivery.lock();
                        delivery.sent_total += sent as u64;
                        delivery.last_failure = Some(Utc::now());
                        delivery.last_error = Some(source.to_string());
                    }
                    self.set_phase(PushPhase::Idle);
                    warn!(
                        sent,
                        requeued,
                        error = %source,
                        "Push flush interrupted, payloads kept"
                    );
                    return Err(FlushError {
                        sent,
                        requeued,
                        source,
                    });
                }
            }
        }

        {
            let mut delivery = self.delivery.lock();
            delivery.sent_total += sent as u64;
            delivery.last_success = Some(Utc::now());
            delivery.last_error = None;
        }
        self.set_phase(PushPhase::Idle);
        debug!(sent, "Push buffer flushed");
        Ok(sent)
    }

    fn next_in_batch(&self, last_seq: u64) -> Option<BufferEntry> {
        self.buffer
            .lock()
            .front()
            .filter(|entry| entry.seq <= last_seq)
            .cloned()
    }

    /// Remove a delivered entry unless the cap or the cleanup task already
    /// dropped it.
    fn confirm(&self, seq: u64) {
        let mut buffer = self.buffer.lock();
        if buffer.front().is_some_and(|entry| entry.seq == seq) {
            buffer.pop_front();
        }
    }

    fn remaining_in_batch(&self, last_seq: u64) -> usize {
        self.buffer
            .lock()
            .iter()
            .take_while(|entry| entry.seq <= last_seq)
            .count()
    }

    async fn deliver(&self, entry: &BufferEntry) -> Result<(), BreakerError<TransportError>> {
        self.breaker.execute(|| self.send(&entry.payload)).await
    }

    /// Send over a pooled connection, or an unpooled one when the pool is
    /// exhausted.
    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        match self.pool.acquire() {
            Ok(connection) => {
                let result = self.transport.send(&connection, payload).await;
                self.pool.release(connection);
                result
            }
            Err(PoolError::Exhausted { .. }) => {
                debug!("Push pool exhausted, using an unpooled connection");
                let connection = self.transport.connect()?;
                self.transport.send(&connection, payload).await
            }
            Err(e @ PoolError::Create { .. }) => Err(TransportError::Connect(e.to_string())),
        }
    }

    /// Drop buffer entries older than the configured age and idle
    /// connections past their timeout.
    pub fn evict_stale(&self) -> StaleEviction {
        let max_age = self.settings.buffer_max_age;
        let expired = {
            let mut buffer = self.buffer.lock();
            let before = buffer.len();
            buffer.retain(|entry| entry.age() <= max_age);
            before - buffer.len()
        };
        self.note_dropped(DropReason::Expired, expired);

        let idle_connections = self.pool.evict_idle(self.settings.pool_idle_timeout);
        StaleEviction {
            buffer_entries: expired,
            idle_connections,
        }
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn status(&self) -> PushStatus {
        let breaker = self.breaker.snapshot();
        let pool = self.pool.stats();
        let delivery = self.delivery.lock();

        PushStatus {
            phase: *self.phase.lock(),
            buffer_depth: self.buffer_depth(),
            max_batch_size: self.settings.max_batch_size,
            max_buffer_entries: self.settings.max_buffer_entries,
            breaker_state: breaker.state.as_str(),
            consecutive_failures: breaker.consecutive_failures,
            failure_threshold: breaker.failure_threshold,
            retry_in_ms: breaker.retry_in.map(|d| d.as_millis() as u64),
            breaker_opened_total: breaker.opened_total,
            pool_in_use: pool.in_use,
            pool_idle: pool.idle,
            pool_max_size: pool.max_size,
            sent_total: delivery.sent_total,
            dropped_total: delivery.dropped_total,
            last_success: delivery.last_success.map(|t| t.to_rfc3339()),
            last_failure: delivery.last_failure.map(|t| t.to_rfc3339()),
            last_error: delivery.last_error.clone(),
        }
    }

    pub fn drain_pool(&self) -> usize {
        self.pool.drain()
    }
}

#[async_trait]
impl<T: PushTransport> PushDriver for PushPipeline<T> {
    async fn run_cycle(&self) -> Result<CycleOutcome, FlushError> {
        PushPipeline::run_cycle(self).await
    }

    async fn flush(&self) -> Result<usize, FlushError> {
        PushPipeline::flush(self).await
    }

    fn buffer_depth(&self) -> usize {
        PushPipeline::buffer_depth(self)
    }

    fn status(&self) -> PushStatus {
        PushPipeline::status(self)
    }

    fn evict_stale(&self) -> StaleEviction {
        PushPipeline::evict_stale(self)
    }

    fn drain_pool(&self) -> usize {
        let drained = PushPipeline::drain_pool(self);
        info!(drained, "Push connection pool drained");
        drained
    }
}
