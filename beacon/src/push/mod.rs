//! Push delivery of metric snapshots to a remote gateway.
//!
//! [`PushPipeline`] buffers serialized snapshots and delivers them through a
//! circuit breaker and a connection pool. The service holds it behind the
//! object-safe [`PushDriver`] trait so the transport type stays out of its
//! signature.

mod pipeline;
mod transport;

use async_trait::async_trait;
use serde::Serialize;

pub use pipeline::{
    BufferEntry, CycleOutcome, FlushError, PipelineSettings, PushPhase, PushPipeline,
    StaleEviction,
};
pub use transport::{HttpPushTransport, PushTransport, TransportError};

/// Point-in-time view of the push pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PushStatus {
    pub phase: PushPhase,
    pub buffer_depth: usize,
    pub max_batch_size: usize,
    pub max_buffer_entries: usize,
    pub breaker_state: &'static str,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub retry_in_ms: Option<u64>,
    pub breaker_opened_total: u64,
    pub pool_in_use: usize,
    pub pool_idle: usize,
    pub pool_max_size: usize,
    pub sent_total: u64,
    pub dropped_total: u64,
    pub last_success: Option<String>,
    pub last_failure: Option<String>,
    pub last_error: Option<String>,
}

/// Type-erased handle on a push pipeline.
#[async_trait]
pub trait PushDriver: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleOutcome, FlushError>;

    async fn flush(&self) -> Result<usize, FlushError>;

    fn buffer_depth(&self) -> usize;

    fn status(&self) -> PushStatus;

    fn evict_stale(&self) -> StaleEviction;

    fn drain_pool(&self) -> usize;
}
