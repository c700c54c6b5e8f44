//! Failure-isolation primitives shared across the workspace.
//!
//! - [`CircuitBreaker`]: stops calling a failing dependency for a cooldown
//!   period after repeated consecutive failures.
//! - [`ResourcePool`]: bounded, non-blocking pool of reusable handles.
//!
//! Both types keep their state behind short synchronous locks that are never
//! held across an `.await`, so they can be shared freely between tasks.

mod circuit_breaker;
mod pool;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState, TransitionCallback,
};
pub use pool::{PoolError, PoolStats, Pooled, ResourcePool};
