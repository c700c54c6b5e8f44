//! Service lifecycle state.
//!
//! Tracks in-flight operations and the shutdown flag, and owns the
//! cancellation token that stops background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keeps the pending operation count incremented while alive.
#[derive(Debug)]
#[must_use = "the operation is only counted while the guard is alive"]
pub struct OperationGuard {
    pending: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Result of waiting for in-flight operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every operation finished.
    Drained,
    /// The deadline passed with operations still running.
    TimedOut { pending: usize },
}

#[derive(Debug)]
pub struct Lifecycle {
    shutting_down: AtomicBool,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    started_at: Instant,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Count an operation until the returned guard is dropped.
    pub fn begin_operation(&self) -> OperationGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        OperationGuard {
            pending: Arc::clone(&self.pending),
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Flip the shutdown flag and cancel background tasks.
    ///
    /// Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Token cancelled when shutdown begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Poll until no operation is pending or `deadline` has passed.
    pub async fn wait_for_idle(&self, deadline: Duration, poll: Duration) -> DrainOutcome {
        let until = Instant::now() + deadline;
        loop {
            let pending = self.pending_operations();
            if pending == 0 {
                return DrainOutcome::Drained;
            }
            if Instant::now() >= until {
                return DrainOutcome::TimedOut { pending };
            }
            debug!(pending, "Waiting for pending operations");
            tokio::time::sleep(poll.min(until - Instant::now())).await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
