//! Post-restart readiness confirmation.
//!
//! After a restart the engine waits here until the server looks genuinely
//! alive (unit active, process present, consuming CPU) before applying
//! performance tweaks and declaring recovery complete.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::perf::PerformanceSource;

/// Poll cadence while waiting for the server to come up.
const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Pause after the first good sample, so a process that immediately dies
/// again is not reported ready.
const STABILIZE_PAUSE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Blocks until the server is confirmed ready or `max_wait` elapses.
    async fn wait_until_ready(&self, max_wait: Duration) -> bool;
}

/// Probe that samples the same performance source the patrol uses.
pub struct PerformanceReadinessProbe {
    source: Arc<dyn PerformanceSource>,
}

impl PerformanceReadinessProbe {
    pub fn new(source: Arc<dyn PerformanceSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ReadinessProbe for PerformanceReadinessProbe {
    async fn wait_until_ready(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        while Instant::now() < deadline {
            match self.source.sample().await {
                Ok(s) if s.service_active && s.pid.is_some() && s.cpu_percent > 0.0 => {
                    info!("server responding (pid {:?}), stabilizing", s.pid);
                    sleep(STABILIZE_PAUSE).await;
                    return true;
                }
                Ok(s) => {
                    debug!(
                        "not ready yet: active={} pid={:?} cpu={:.1}",
                        s.service_active, s.pid, s.cpu_percent
                    );
                }
                Err(e) => debug!("readiness sample failed: {e:#}"),
            }
            sleep(POLL_INTERVAL).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::PerformanceSample;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted source: down for the first N samples, then healthy.
    struct ScriptedSource {
        down_samples: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PerformanceSource for ScriptedSource {
        async fn sample(&self) -> Result<PerformanceSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.down_samples {
                Ok(PerformanceSample::absent())
            } else {
                Ok(PerformanceSample {
                    pid: Some(4321),
                    cpu_percent: 12.5,
                    memory_mb: 2048,
                    estimated_players: 0,
                    service_active: true,
                    timestamp: chrono::Utc::now(),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_ready_once_server_responds() {
        let probe = PerformanceReadinessProbe::new(Arc::new(ScriptedSource {
            down_samples: 2,
            calls: AtomicUsize::new(0),
        }));
        assert!(probe.wait_until_ready(Duration::from_secs(120)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_server_never_responds() {
        let probe = PerformanceReadinessProbe::new(Arc::new(ScriptedSource {
            down_samples: usize::MAX,
            calls: AtomicUsize::new(0),
        }));
        assert!(!probe.wait_until_ready(Duration::from_secs(30)).await);
    }
}
