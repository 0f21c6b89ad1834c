//! Shared application state for the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::metrics::WatchdogMetrics;
use crate::ratelimit::RateLimiter;
use crate::watchdog::WatchdogEngine;

/// Shared state handed to every handler.
pub type SharedState = Arc<AppState>;

/// Everything the operator endpoint needs, shared behind one Arc.
pub struct AppState {
    pub engine: Arc<WatchdogEngine>,
    pub metrics: Arc<WatchdogMetrics>,
    pub restart_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
