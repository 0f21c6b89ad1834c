//! Operator alert delivery and per-category cooldowns.
//!
//! The engine raises alerts through the [`AlertSink`] trait so the delivery
//! channel stays swappable; the production sink writes structured log events
//! on a dedicated target that deployments route to their notification
//! pipeline.

use ahash::AHashMap;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Alert text is capped before delivery so one runaway payload cannot choke
/// the channel.
pub const MAX_ALERT_BYTES: usize = 2000;

/// Delivery channel for operator notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Admin-facing alert; urgent ones are expected to page.
    async fn notify_admin(&self, text: &str, urgent: bool);
    /// Player/public-facing announcement.
    async fn notify_public(&self, text: &str);
}

/// Truncates to at most [`MAX_ALERT_BYTES`] without splitting a UTF-8
/// character.
pub fn truncate_alert(text: &str) -> &str {
    if text.len() <= MAX_ALERT_BYTES {
        return text;
    }
    let mut end = MAX_ALERT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Production sink: alerts become log events on the `alerts` target.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify_admin(&self, text: &str, urgent: bool) {
        let text = truncate_alert(text);
        if urgent {
            error!(target: "alerts", audience = "admin", "{text}");
        } else {
            warn!(target: "alerts", audience = "admin", "{text}");
        }
    }

    async fn notify_public(&self, text: &str) {
        let text = truncate_alert(text);
        info!(target: "alerts", audience = "public", "{text}");
    }
}

/// Per-category alert suppression with a fixed cooldown.
///
/// A category that alerted within the cooldown stays silent; the caller
/// checks and marks in one call so repeated patrol ticks cannot spam.
pub struct AlertCooldowns {
    cooldown: Duration,
    last_sent: Mutex<AHashMap<String, Instant>>,
}

impl AlertCooldowns {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(AHashMap::new()),
        }
    }

    /// Returns true and records the send when `category` is off cooldown.
    pub async fn should_send(&self, category: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_sent.lock().await;
        match last.get(category) {
            Some(at) if now.duration_since(*at) < self.cooldown => false,
            _ => {
                last.insert(category.to_string(), now);
                true
            }
        }
    }

    /// Clears a category so the next event alerts immediately (used when a
    /// condition resolves and re-triggers).
    pub async fn reset(&self, category: &str) {
        self.last_sent.lock().await.remove(category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooldown_suppresses_repeat_alerts() {
        let cooldowns = AlertCooldowns::new(Duration::from_secs(600));
        assert!(cooldowns.should_send("high_cpu").await);
        assert!(!cooldowns.should_send("high_cpu").await);
        assert!(cooldowns.should_send("server_down").await);
    }

    #[tokio::test]
    async fn reset_reopens_a_category() {
        let cooldowns = AlertCooldowns::new(Duration::from_secs(600));
        assert!(cooldowns.should_send("memory").await);
        assert!(!cooldowns.should_send("memory").await);
        cooldowns.reset("memory").await;
        assert!(cooldowns.should_send("memory").await);
    }

    #[tokio::test]
    async fn expired_cooldown_allows_again() {
        let cooldowns = AlertCooldowns::new(Duration::from_millis(20));
        assert!(cooldowns.should_send("down").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cooldowns.should_send("down").await);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "x".repeat(3000);
        assert_eq!(truncate_alert(&long).len(), MAX_ALERT_BYTES);

        // 4-byte scorching emoji straddling the cap must not be split.
        let mut tricky = "y".repeat(MAX_ALERT_BYTES - 2);
        tricky.push('🔥');
        let out = truncate_alert(&tricky);
        assert!(out.len() <= MAX_ALERT_BYTES);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn short_text_passes_through() {
        assert_eq!(truncate_alert("server back online"), "server back online");
    }
}
