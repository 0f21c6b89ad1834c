//! HTTP endpoint handlers for the operator surface.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/health`: Daemon health check
//! - `/status`: Watchdog counters and restart history as JSON
//! - `/metrics`: Prometheus metrics endpoint
//! - `POST /restart`: Rate-limited manual restart trigger

pub mod health;
pub mod metrics;
pub mod restart;
pub mod status;

// Re-export handlers
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use restart::restart_handler;
pub use status::status_handler;
