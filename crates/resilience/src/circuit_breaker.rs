//! Circuit breaker for protecting callers against a failing dependency.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing, rejecting requests).
    Open,
    /// Circuit is half-open (testing if the dependency recovered).
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{name}' is open (retry in {retry_in:?})")]
    Open { name: String, retry_in: Duration },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected without running the operation.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The underlying operation error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Remaining cooldown while open, `None` otherwise.
    pub retry_in: Option<Duration>,
    /// Number of times the circuit has opened.
    pub opened_total: u64,
}

/// Callback invoked synchronously after every state change.
pub type TransitionCallback = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
    opened_total: u64,
}

/// Circuit breaker guarding a single dependency.
///
/// Closed → open once `consecutive_failures >= failure_threshold`. Open →
/// half-open when more than `cooldown` has passed since the last failure; the
/// half-open state admits exactly one trial call. A success anywhere closes
/// the circuit and resets the failure count; a failed trial reopens it
/// without resetting the count.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    callbacks: RwLock<Vec<TransitionCallback>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                trial_in_flight: false,
                opened_total: 0,
            }),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Register a callback for state transitions.
    pub fn on_transition(&self, callback: TransitionCallback) {
        self.callbacks.write().push(callback);
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_in = match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => Some(self.config.cooldown.saturating_sub(at.elapsed())),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
            retry_in,
            opened_total: inner.opened_total,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] while the circuit is open and
    /// the cooldown has not elapsed.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_trial = self.admit().map_err(|retry_in| BreakerError::Open {
            name: self.name.clone(),
            retry_in,
        })?;

        // Releases the half-open slot if the caller drops us mid-flight.
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.state != CircuitState::Closed;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.last_failure_at = None;
            inner.trial_in_flight = false;
            changed
        };
        debug!(breaker = %self.name, "Circuit breaker reset to closed state");
        if changed {
            self.notify(CircuitState::Closed);
        }
    }

    /// Decide whether a call may proceed. `Ok(true)` marks a half-open trial,
    /// `Err` carries the remaining cooldown.
    fn admit(&self) -> Result<bool, Duration> {
        let mut transitioned = false;
        let admitted = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed > self.config.cooldown {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        transitioned = true;
                        Ok(true)
                    } else {
                        Err(self.config.cooldown.saturating_sub(elapsed))
                    }
                }
                CircuitState::HalfOpen if inner.trial_in_flight => Err(Duration::ZERO),
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        };

        if transitioned {
            debug!(breaker = %self.name, "Circuit breaker transitioned to half-open state");
            self.notify(CircuitState::HalfOpen);
        }
        admitted
    }

    fn record_success(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            previous
        };

        if previous != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
            self.notify(CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let opened = {
            let mut inner = self.inner.lock();
            inner.trial_in_flight = false;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure_at = Some(Instant::now());
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_total += 1;
                        Some(inner.consecutive_failures)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure_at = Some(Instant::now());
                    inner.state = CircuitState::Open;
                    inner.opened_total += 1;
                    Some(inner.consecutive_failures)
                }
                // Already open: a straggler admitted before the circuit opened.
                CircuitState::Open => None,
            }
        };

        if let Some(failures) = opened {
            warn!(
                breaker = %self.name,
                failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.notify(CircuitState::Open);
        }
    }

    fn notify(&self, state: CircuitState) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&self.name, state);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}
