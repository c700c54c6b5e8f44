//! HTTP endpoint server.
//!
//! Serves the scrape endpoint, the JSON summary, the health probes and the
//! service information routes.

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState, EndpointToggles};
