//! API middleware.
//!
//! Provides middleware for authentication, request limits and timing.

pub mod auth;
pub mod limits;
pub mod timing;

pub use auth::{BearerAuth, require_bearer};
pub use limits::{ConcurrencyLimit, RequestTimeout, enforce_timeout, limit_concurrency};
pub use timing::track_request;
