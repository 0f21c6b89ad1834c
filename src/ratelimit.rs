//! Keyed sliding-window rate limiting.
//!
//! Guards the manual restart trigger against rapid repeat invocation. The
//! watchdog's hourly restart budget uses the same sliding-window discipline
//! but lives with the restart history in the engine.

use ahash::AHashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter over arbitrary string keys.
///
/// Each key holds an ordered list of call instants. A call is allowed when
/// fewer than `max_calls` instants remain inside the trailing window; the
/// check and the append happen under one lock so concurrent callers cannot
/// both slip under the limit.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    buckets: Mutex<AHashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            buckets: Mutex::new(AHashMap::new()),
        }
    }

    /// Returns true and records the call if `key` is under its limit.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let calls = buckets.entry(key.to_string()).or_default();

        // Entries at exactly now - window have aged out.
        calls.retain(|t| now.duration_since(*t) < self.window);

        if calls.len() < self.max_calls {
            calls.push(now);
            true
        } else {
            false
        }
    }

    /// Seconds until the oldest recorded call for `key` ages out.
    ///
    /// Used for the retry-after hint on denial; 0 when the key is unknown.
    pub async fn retry_after_secs(&self, key: &str) -> u64 {
        let now = Instant::now();
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .and_then(|calls| calls.first())
            .map(|oldest| {
                self.window
                    .saturating_sub(now.duration_since(*oldest))
                    .as_secs()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_calls() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        assert!(limiter.allow("op").await);
        assert!(limiter.allow("op").await);
        assert!(limiter.allow("op").await);
        assert!(!limiter.allow("op").await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_frees_slots() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.allow("op").await);
        assert!(limiter.allow("op").await);
        assert!(!limiter.allow("op").await);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.allow("op").await);
    }

    #[tokio::test(start_paused = true)]
    async fn call_exactly_at_window_boundary_is_allowed() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.allow("op").await);

        // One tick short of the window: the old call still counts.
        tokio::time::advance(Duration::from_secs(10) - Duration::from_millis(1)).await;
        assert!(!limiter.allow("op").await);

        // Exactly at the boundary the old call has aged out.
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.allow("op").await);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reports_remaining_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.allow("op").await);
        assert!(!limiter.allow("op").await);
        assert_eq!(limiter.retry_after_secs("op").await, 10);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(limiter.retry_after_secs("op").await, 6);
        assert_eq!(limiter.retry_after_secs("unknown").await, 0);
    }
}
