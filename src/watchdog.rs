//! Fault classification and automated recovery.
//!
//! The engine holds the durable watchdog state, classifies each performance
//! sample against the configured thresholds and drives the stop/start
//! recovery procedure. All mutation happens under one lock, so at most one
//! restart is ever in flight and patrol ticks cannot interleave.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alerts::{AlertCooldowns, AlertSink};
use crate::config::Config;
use crate::executor::CommandExecutor;
use crate::metrics::WatchdogMetrics;
use crate::perf::{PerformanceSample, PerformanceSource};
use crate::readiness::ReadinessProbe;
use crate::store::PersistentStateStore;

/// Store key the engine persists its state under.
pub const WATCHDOG_STATE_KEY: &str = "watchdog_state";
/// Store key for the most recent performance sample.
pub const LAST_PERFORMANCE_KEY: &str = "last_performance";

const RESTART_HISTORY_CAPACITY: usize = 10;

/// One completed restart, as recorded in the history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Lifetime sequence number, survives history eviction.
    pub sequence: u64,
}

/// Fixed-capacity ring buffer of restart events, oldest evicted first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartHistory {
    slots: Vec<RestartEvent>,
    head: usize,
}

impl RestartHistory {
    pub fn push(&mut self, event: RestartEvent) {
        if self.slots.len() < RESTART_HISTORY_CAPACITY {
            self.slots.push(event);
        } else {
            self.slots[self.head] = event;
            self.head = (self.head + 1) % RESTART_HISTORY_CAPACITY;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Events oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RestartEvent> {
        let (wrapped, oldest_first) = self.slots.split_at(self.head);
        oldest_first.iter().chain(wrapped.iter())
    }

    pub fn newest(&self) -> Option<&RestartEvent> {
        if self.slots.is_empty() {
            None
        } else if self.slots.len() < RESTART_HISTORY_CAPACITY {
            self.slots.last()
        } else {
            let idx = (self.head + RESTART_HISTORY_CAPACITY - 1) % RESTART_HISTORY_CAPACITY;
            self.slots.get(idx)
        }
    }

    /// Restarts recorded within the trailing window ending at `now`.
    pub fn count_since(&self, now: DateTime<Utc>, window: ChronoDuration) -> usize {
        let cutoff = now - window;
        self.iter().filter(|e| e.timestamp > cutoff).count()
    }
}

/// Durable engine state, persisted after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogState {
    #[serde(default)]
    pub down_counter: u32,
    #[serde(default)]
    pub high_cpu_counter: u32,
    #[serde(default)]
    pub high_memory_counter: u32,
    /// Restarts since the last daily report rollover.
    #[serde(default)]
    pub restart_count: u64,
    /// Lifetime restart sequence, never reset.
    #[serde(default)]
    pub restart_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_history: RestartHistory,
    /// Edge detector for crash auditing.
    #[serde(default)]
    pub server_was_running: bool,
}

/// Effective thresholds and pacing, resolved once from config.
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub service_unit: String,
    pub process_names: Vec<String>,
    pub server_down_threshold: u32,
    pub memory_leak_threshold_mb: u64,
    pub memory_warning_threshold_mb: u64,
    pub continuous_high_cpu: u32,
    pub cpu_trip_percent: f64,
    pub max_restarts_per_hour: usize,
    pub restart_settle: Duration,
    pub ready_max_wait: Duration,
    pub command_timeout: Duration,
    pub enable_tuning: bool,
}

impl WatchdogSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            service_unit: cfg
                .service_unit
                .clone()
                .unwrap_or_else(|| crate::config::DEFAULT_SERVICE_UNIT.to_string()),
            process_names: cfg.process_names.clone().unwrap_or_default(),
            server_down_threshold: cfg.server_down_threshold.unwrap_or(2),
            memory_leak_threshold_mb: cfg.memory_leak_threshold_mb.unwrap_or(12000),
            memory_warning_threshold_mb: cfg.memory_warning_threshold_mb(),
            continuous_high_cpu: cfg.continuous_high_cpu.unwrap_or(5),
            cpu_trip_percent: cfg.cpu_trip_percent.unwrap_or(95.0),
            max_restarts_per_hour: cfg.max_restarts_per_hour.unwrap_or(3),
            restart_settle: Duration::from_secs(cfg.restart_settle_secs.unwrap_or(15)),
            ready_max_wait: Duration::from_secs(cfg.ready_max_wait_secs.unwrap_or(120)),
            command_timeout: Duration::from_secs(cfg.command_timeout_secs.unwrap_or(30)),
            enable_tuning: cfg.enable_tuning.unwrap_or(true),
        }
    }
}

/// Serializable snapshot for /status and the `status` subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub server_running: bool,
    pub down_counter: u32,
    pub high_cpu_counter: u32,
    pub high_memory_counter: u32,
    pub restart_count: u64,
    pub restarts_last_hour: usize,
    pub last_restart: Option<DateTime<Utc>>,
    pub restart_history: Vec<RestartEvent>,
}

pub struct WatchdogEngine {
    settings: WatchdogSettings,
    source: Arc<dyn PerformanceSource>,
    executor: Arc<dyn CommandExecutor>,
    alerts: Arc<dyn AlertSink>,
    probe: Arc<dyn ReadinessProbe>,
    cooldowns: AlertCooldowns,
    store: Arc<PersistentStateStore>,
    metrics: Arc<WatchdogMetrics>,
    state: Mutex<WatchdogState>,
}

impl WatchdogEngine {
    /// Builds the engine, restoring persisted state if present.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        settings: WatchdogSettings,
        alert_cooldown: Duration,
        source: Arc<dyn PerformanceSource>,
        executor: Arc<dyn CommandExecutor>,
        alerts: Arc<dyn AlertSink>,
        probe: Arc<dyn ReadinessProbe>,
        store: Arc<PersistentStateStore>,
        metrics: Arc<WatchdogMetrics>,
    ) -> Self {
        let state = store
            .get_as::<WatchdogState>(WATCHDOG_STATE_KEY)
            .await
            .unwrap_or_default();
        info!(
            "watchdog state restored: {} lifetime restarts, history depth {}",
            state.restart_sequence,
            state.restart_history.len()
        );
        Self {
            settings,
            source,
            executor,
            alerts,
            probe,
            cooldowns: AlertCooldowns::new(alert_cooldown),
            store,
            metrics,
            state: Mutex::new(state),
        }
    }

    /// Startup announcement with the restored counters.
    pub async fn announce_online(&self) {
        let state = self.state.lock().await;
        self.alerts
            .notify_admin(
                &format!(
                    "Watchdog online. Counters: down={} cpu={} mem={}; {} restarts on record",
                    state.down_counter,
                    state.high_cpu_counter,
                    state.high_memory_counter,
                    state.restart_sequence
                ),
                false,
            )
            .await;
    }

    /// One patrol cycle: sample, classify, recover if needed, persist.
    ///
    /// Never returns an error; a failed sample degrades to a logged no-op so
    /// a transient /proc hiccup cannot take the loop down.
    pub async fn patrol_once(&self) {
        self.metrics.patrols_total.inc();

        let sample = match self.source.sample().await {
            Ok(s) => s,
            Err(e) => {
                warn!("performance sample failed, skipping cycle: {e:#}");
                self.metrics.sample_failures_total.inc();
                return;
            }
        };

        let running = sample.service_active && sample.pid.is_some();
        self.metrics.server_up.set(running as i64);
        self.metrics.cpu_percent.set(sample.cpu_percent);
        self.metrics.memory_mb.set(sample.memory_mb as i64);
        self.metrics
            .estimated_players
            .set(sample.estimated_players as i64);

        if let Ok(v) = serde_json::to_value(&sample) {
            if let Err(e) = self.store.set(LAST_PERFORMANCE_KEY, v).await {
                error!("could not persist performance snapshot: {e:#}");
            }
        }

        let mut state = self.state.lock().await;

        if state.server_was_running && !running {
            warn!("server process vanished between patrols (crash suspected)");
            if self.cooldowns.should_send("crash_edge").await {
                self.alerts
                    .notify_admin("Server process disappeared since the last check", true)
                    .await;
            }
        }
        state.server_was_running = running;

        self.check_availability(&mut state, running).await;
        if running {
            self.check_memory(&mut state, &sample).await;
            self.check_cpu(&mut state, &sample).await;
        }

        self.metrics.down_counter.set(state.down_counter as i64);
        self.metrics
            .high_cpu_counter
            .set(state.high_cpu_counter as i64);
        self.metrics
            .high_memory_counter
            .set(state.high_memory_counter as i64);

        self.persist(&state).await;
    }

    async fn check_availability(&self, state: &mut WatchdogState, running: bool) {
        if running {
            if state.down_counter > 0 {
                info!("server back online after {} down checks", state.down_counter);
                self.alerts.notify_public("Server is back online").await;
                self.cooldowns.reset("server_down").await;
            }
            state.down_counter = 0;
            return;
        }

        state.down_counter += 1;
        if state.down_counter >= self.settings.server_down_threshold {
            if self.cooldowns.should_send("server_down").await {
                self.alerts
                    .notify_admin(
                        &format!(
                            "Server offline for {} consecutive checks, restarting",
                            state.down_counter
                        ),
                        true,
                    )
                    .await;
            }
            if self.request_restart(state, "server offline").await {
                state.down_counter = 0;
            }
        } else if self.cooldowns.should_send("server_down_warning").await {
            self.alerts
                .notify_admin(
                    &format!(
                        "Server not responding ({}/{} checks)",
                        state.down_counter, self.settings.server_down_threshold
                    ),
                    false,
                )
                .await;
        }
    }

    async fn check_memory(&self, state: &mut WatchdogState, sample: &PerformanceSample) {
        let hard = self.settings.memory_leak_threshold_mb;
        let warn_at = self.settings.memory_warning_threshold_mb;

        if sample.memory_mb >= hard {
            self.alerts
                .notify_admin(
                    &format!(
                        "Memory leak: {} MB >= {} MB limit, restarting now",
                        sample.memory_mb, hard
                    ),
                    true,
                )
                .await;
            if self.request_restart(state, "memory leak").await {
                state.high_memory_counter = 0;
                state.high_cpu_counter = 0;
            }
        } else if sample.memory_mb >= warn_at {
            state.high_memory_counter += 1;
            if self.cooldowns.should_send("high_memory").await {
                self.alerts
                    .notify_admin(
                        &format!(
                            "Memory elevated: {} MB (warning at {} MB, restart at {} MB)",
                            sample.memory_mb, warn_at, hard
                        ),
                        false,
                    )
                    .await;
            }
        } else {
            if state.high_memory_counter > 0 {
                info!("memory back below warning threshold ({} MB)", sample.memory_mb);
                self.cooldowns.reset("high_memory").await;
            }
            state.high_memory_counter = 0;
        }
    }

    async fn check_cpu(&self, state: &mut WatchdogState, sample: &PerformanceSample) {
        if sample.cpu_percent >= self.settings.cpu_trip_percent {
            state.high_cpu_counter += 1;
            if state.high_cpu_counter >= self.settings.continuous_high_cpu {
                if sample.estimated_players > 0 {
                    // Restarting under load would kick players; back the
                    // counter off so the condition re-trips soon if sustained.
                    if self.cooldowns.should_send("cpu_deferral").await {
                        self.alerts
                            .notify_admin(
                                &format!(
                                    "CPU overloaded ({:.1}%) but ~{} players online, deferring restart",
                                    sample.cpu_percent, sample.estimated_players
                                ),
                                true,
                            )
                            .await;
                    }
                    state.high_cpu_counter =
                        self.settings.continuous_high_cpu.saturating_sub(2);
                } else if self.request_restart(state, "CPU overload").await {
                    state.high_cpu_counter = 0;
                }
            } else if self.cooldowns.should_send("high_cpu").await {
                self.alerts
                    .notify_admin(
                        &format!(
                            "CPU at {:.1}% ({}/{} checks before restart)",
                            sample.cpu_percent,
                            state.high_cpu_counter,
                            self.settings.continuous_high_cpu
                        ),
                        false,
                    )
                    .await;
            }
        } else {
            if state.high_cpu_counter > 0 {
                if self.cooldowns.should_send("cpu_normalized").await {
                    self.alerts
                        .notify_admin(
                            &format!("CPU back to normal ({:.1}%)", sample.cpu_percent),
                            false,
                        )
                        .await;
                }
                self.cooldowns.reset("high_cpu").await;
            }
            state.high_cpu_counter = 0;
        }
    }

    /// Restart gated by the trailing-hour budget.
    async fn request_restart(&self, state: &mut WatchdogState, reason: &str) -> bool {
        let recent = state
            .restart_history
            .count_since(Utc::now(), ChronoDuration::hours(1));
        if recent >= self.settings.max_restarts_per_hour {
            warn!("restart for '{reason}' suppressed: {recent} restarts in the last hour");
            if self.cooldowns.should_send("restart_budget").await {
                self.alerts
                    .notify_admin(
                        &format!(
                            "Restart needed ({reason}) but {recent} restarts already \
                             happened this hour. Manual intervention required."
                        ),
                        true,
                    )
                    .await;
            }
            return false;
        }
        self.restart_locked(state, reason).await
    }

    /// Operator-triggered restart; bypasses the hourly budget but still
    /// records history. Caller applies its own rate limiting.
    pub async fn force_restart(&self, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let ok = self.restart_locked(&mut state, reason).await;
        if ok {
            state.down_counter = 0;
            state.high_cpu_counter = 0;
            state.high_memory_counter = 0;
        }
        self.persist(&state).await;
        ok
    }

    /// The recovery procedure. Caller holds the state lock.
    ///
    /// History is appended only once the start succeeded; an abort before
    /// anything was stopped must not consume the hourly budget.
    async fn restart_locked(&self, state: &mut WatchdogState, reason: &str) -> bool {
        info!("restarting server: {reason}");
        self.alerts
            .notify_admin(&format!("Restarting server: {reason}"), false)
            .await;
        self.alerts
            .notify_public("Server restart in progress, back in a few minutes")
            .await;

        if !self.systemctl("stop").await {
            warn!("graceful stop failed, force-killing server process");
            let mut killed = false;
            for name in &self.settings.process_names {
                let args = vec!["-f".to_string(), name.clone()];
                match self
                    .executor
                    .run("pkill", &args, self.settings.command_timeout)
                    .await
                {
                    Ok(out) if out.success => killed = true,
                    Ok(_) => {}
                    Err(e) => warn!("pkill {name} failed: {e:#}"),
                }
            }
            if !killed {
                self.alerts
                    .notify_admin(
                        "Could not stop the server (graceful stop and force kill both failed)",
                        true,
                    )
                    .await;
                return false;
            }
        }

        tokio::time::sleep(self.settings.restart_settle).await;

        if !self.systemctl("start").await {
            self.alerts
                .notify_admin("Server stop succeeded but start failed", true)
                .await;
            return false;
        }

        let now = Utc::now();
        state.restart_count += 1;
        state.restart_sequence += 1;
        state.last_restart = Some(now);
        state.restart_history.push(RestartEvent {
            timestamp: now,
            reason: reason.to_string(),
            sequence: state.restart_sequence,
        });
        self.metrics.restarts_total.inc();
        self.persist(state).await;
        self.alerts
            .notify_admin(
                &format!(
                    "Server restart #{} successful ({reason}), awaiting readiness",
                    state.restart_sequence
                ),
                false,
            )
            .await;

        if self
            .probe
            .wait_until_ready(self.settings.ready_max_wait)
            .await
        {
            self.apply_performance_tweaks().await;
            self.alerts
                .notify_admin(&format!("Server restart completed ({reason})"), false)
                .await;
            self.alerts.notify_public("Server is back online").await;
        } else {
            self.alerts
                .notify_admin(
                    &format!(
                        "Server started but readiness was not confirmed within {}s",
                        self.settings.ready_max_wait.as_secs()
                    ),
                    true,
                )
                .await;
        }
        true
    }

    async fn systemctl(&self, action: &str) -> bool {
        let args = vec![action.to_string(), self.settings.service_unit.clone()];
        match self
            .executor
            .run("systemctl", &args, self.settings.command_timeout)
            .await
        {
            Ok(out) => {
                if !out.success {
                    warn!(
                        "systemctl {action} {} failed: {}",
                        self.settings.service_unit,
                        out.stderr.trim()
                    );
                }
                out.success
            }
            Err(e) => {
                warn!("systemctl {action} error: {e:#}");
                false
            }
        }
    }

    /// Best-effort priority/IO/affinity tuning after a confirmed restart.
    async fn apply_performance_tweaks(&self) {
        if !self.settings.enable_tuning {
            return;
        }
        let pid = match self.source.sample().await {
            Ok(s) => match s.pid {
                Some(pid) => pid,
                None => return,
            },
            Err(_) => return,
        };
        let pid_arg = pid.to_string();
        let cpu_list = format!("0-{}", online_cpus().saturating_sub(1));

        let tweaks: [(&str, Vec<String>); 3] = [
            ("renice", vec!["-n".into(), "-5".into(), "-p".into(), pid_arg.clone()]),
            ("ionice", vec!["-c2".into(), "-n0".into(), "-p".into(), pid_arg.clone()]),
            ("taskset", vec!["-cp".into(), cpu_list, pid_arg]),
        ];
        for (cmd, args) in tweaks {
            match self
                .executor
                .run(cmd, &args, self.settings.command_timeout)
                .await
            {
                Ok(out) if out.success => {}
                Ok(out) => warn!("{cmd} tweak failed: {}", out.stderr.trim()),
                Err(e) => warn!("{cmd} tweak error: {e:#}"),
            }
        }
        info!("performance tweaks applied to pid {pid}");
    }

    /// Daily rollover: summary alert, then the per-period counter resets.
    pub async fn daily_report(&self) {
        let mut state = self.state.lock().await;
        let since_restart = state
            .last_restart
            .map(|t| format!("{}h ago", (Utc::now() - t).num_hours()))
            .unwrap_or_else(|| "never".to_string());
        self.alerts
            .notify_admin(
                &format!(
                    "Daily report: {} restarts this period, last restart {}. \
                     Counters: down={} cpu={} mem={}",
                    state.restart_count,
                    since_restart,
                    state.down_counter,
                    state.high_cpu_counter,
                    state.high_memory_counter
                ),
                false,
            )
            .await;
        state.restart_count = 0;
        self.persist(&state).await;
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let state = self.state.lock().await;
        StatusSummary {
            server_running: state.server_was_running,
            down_counter: state.down_counter,
            high_cpu_counter: state.high_cpu_counter,
            high_memory_counter: state.high_memory_counter,
            restart_count: state.restart_count,
            restarts_last_hour: state
                .restart_history
                .count_since(Utc::now(), ChronoDuration::hours(1)),
            last_restart: state.last_restart,
            restart_history: state.restart_history.iter().cloned().collect(),
        }
    }

    /// Final flush on shutdown; awaits the lock so an in-flight restart
    /// completes first.
    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    async fn persist(&self, state: &WatchdogState) {
        match serde_json::to_value(state) {
            Ok(v) => {
                if let Err(e) = self.store.set(WATCHDOG_STATE_KEY, v).await {
                    error!("watchdog state persistence failed: {e:#}");
                }
            }
            Err(e) => error!("watchdog state serialization failed: {e}"),
        }
    }
}

fn online_cpus() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if v > 0 {
        v as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn test_settings() -> WatchdogSettings {
        WatchdogSettings {
            service_unit: "satisfactory.service".into(),
            process_names: vec!["FactoryServer".into()],
            server_down_threshold: 2,
            memory_leak_threshold_mb: 12000,
            memory_warning_threshold_mb: 9600,
            continuous_high_cpu: 5,
            cpu_trip_percent: 95.0,
            max_restarts_per_hour: 3,
            restart_settle: Duration::from_millis(1),
            ready_max_wait: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
            enable_tuning: false,
        }
    }

    fn healthy() -> PerformanceSample {
        PerformanceSample {
            pid: Some(1000),
            cpu_percent: 30.0,
            memory_mb: 4000,
            estimated_players: 0,
            service_active: true,
            timestamp: Utc::now(),
        }
    }

    fn down() -> PerformanceSample {
        PerformanceSample::absent()
    }

    struct ScriptedSource {
        samples: StdMutex<VecDeque<PerformanceSample>>,
    }

    impl ScriptedSource {
        fn new(samples: Vec<PerformanceSample>) -> Arc<Self> {
            Arc::new(Self {
                samples: StdMutex::new(samples.into()),
            })
        }
    }

    #[async_trait]
    impl PerformanceSource for ScriptedSource {
        async fn sample(&self) -> Result<PerformanceSample> {
            let next = self.samples.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(healthy))
        }
    }

    /// Records every command; commands listed in `fail` report failure.
    struct RecordingExecutor {
        calls: StdMutex<Vec<String>>,
        fail: Vec<String>,
    }

    impl RecordingExecutor {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(
            &self,
            command: &str,
            args: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            let line = format!("{command} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            let success = !self.fail.iter().any(|f| line.starts_with(f));
            Ok(CommandOutput {
                success,
                stdout: String::new(),
                stderr: if success { String::new() } else { "failed".into() },
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        admin: StdMutex<Vec<(String, bool)>>,
        public: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn notify_admin(&self, text: &str, urgent: bool) {
            self.admin.lock().unwrap().push((text.to_string(), urgent));
        }
        async fn notify_public(&self, text: &str) {
            self.public.lock().unwrap().push(text.to_string());
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn wait_until_ready(&self, _max_wait: Duration) -> bool {
            true
        }
    }

    struct TestHarness {
        engine: WatchdogEngine,
        executor: Arc<RecordingExecutor>,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    async fn harness(
        samples: Vec<PerformanceSample>,
        fail_commands: &[&str],
    ) -> TestHarness {
        harness_with(test_settings(), samples, fail_commands).await
    }

    async fn harness_with(
        settings: WatchdogSettings,
        samples: Vec<PerformanceSample>,
        fail_commands: &[&str],
    ) -> TestHarness {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentStateStore::open(dir.path().join("state.json")));
        let executor = RecordingExecutor::new(fail_commands);
        let sink = Arc::new(RecordingSink::default());
        let engine = WatchdogEngine::new(
            settings,
            Duration::from_secs(600),
            ScriptedSource::new(samples),
            executor.clone(),
            sink.clone(),
            Arc::new(AlwaysReady),
            store,
            Arc::new(WatchdogMetrics::new().unwrap()),
        )
        .await;
        TestHarness {
            engine,
            executor,
            sink,
            _dir: dir,
        }
    }

    fn sample_with(cpu: f64, memory_mb: u64, players: usize) -> PerformanceSample {
        PerformanceSample {
            cpu_percent: cpu,
            memory_mb,
            estimated_players: players,
            ..healthy()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_down_threshold() {
        let h = harness(vec![down(), down()], &[]).await;
        h.engine.patrol_once().await;
        // One down check: no restart yet.
        assert!(!h.executor.calls().iter().any(|c| c.contains("stop")));

        h.engine.patrol_once().await;
        let calls = h.executor.calls();
        assert!(calls.contains(&"systemctl stop satisfactory.service".to_string()));
        assert!(calls.contains(&"systemctl start satisfactory.service".to_string()));

        let status = h.engine.status_summary().await;
        assert_eq!(status.down_counter, 0);
        assert_eq!(status.restart_history.len(), 1);
        assert_eq!(status.restart_history[0].reason, "server offline");
    }

    #[tokio::test(start_paused = true)]
    async fn hourly_budget_suppresses_restart() {
        let h = harness(vec![down(), down()], &[]).await;
        {
            let mut state = h.engine.state.lock().await;
            for seq in 1..=3 {
                state.restart_history.push(RestartEvent {
                    timestamp: Utc::now(),
                    reason: "test".into(),
                    sequence: seq,
                });
            }
        }
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;

        assert!(!h.executor.calls().iter().any(|c| c.contains("stop")));
        let alerts = h.sink.admin.lock().unwrap().clone();
        assert!(alerts
            .iter()
            .any(|(text, urgent)| *urgent && text.contains("Manual intervention")));
        // Counter survives the denial so the next free slot retries.
        assert_eq!(h.engine.status_summary().await.down_counter, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_hard_limit_restarts_same_cycle() {
        let h = harness(vec![sample_with(30.0, 13000, 0)], &[]).await;
        h.engine.patrol_once().await;

        let calls = h.executor.calls();
        assert!(calls.contains(&"systemctl stop satisfactory.service".to_string()));
        let status = h.engine.status_summary().await;
        assert_eq!(status.restart_history[0].reason, "memory leak");
        assert_eq!(status.high_memory_counter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_warning_band_does_not_restart() {
        let h = harness(
            vec![sample_with(30.0, 10000, 0), sample_with(30.0, 10000, 0)],
            &[],
        )
        .await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;

        assert!(!h.executor.calls().iter().any(|c| c.contains("systemctl stop")));
        assert_eq!(h.engine.status_summary().await.high_memory_counter, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_normalized_resets_counter() {
        let h = harness(
            vec![sample_with(30.0, 10000, 0), sample_with(30.0, 4000, 0)],
            &[],
        )
        .await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;
        assert_eq!(h.engine.status_summary().await.high_memory_counter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_overload_restarts_when_empty() {
        let samples = (0..5).map(|_| sample_with(99.0, 4000, 0)).collect();
        let h = harness(samples, &[]).await;
        for _ in 0..5 {
            h.engine.patrol_once().await;
        }

        let calls = h.executor.calls();
        assert!(calls.contains(&"systemctl stop satisfactory.service".to_string()));
        let status = h.engine.status_summary().await;
        assert_eq!(status.restart_history[0].reason, "CPU overload");
        assert_eq!(status.high_cpu_counter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_overload_deferred_while_players_online() {
        let samples = (0..5).map(|_| sample_with(99.0, 4000, 8)).collect();
        let h = harness(samples, &[]).await;
        for _ in 0..5 {
            h.engine.patrol_once().await;
        }

        assert!(!h.executor.calls().iter().any(|c| c.contains("systemctl stop")));
        // Counter backed off to threshold - 2.
        assert_eq!(h.engine.status_summary().await.high_cpu_counter, 3);
        let alerts = h.sink.admin.lock().unwrap().clone();
        assert!(alerts
            .iter()
            .any(|(text, urgent)| *urgent && text.contains("deferring")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_and_kill_do_not_record_history() {
        let h = harness(
            vec![down(), down()],
            &["systemctl stop", "pkill"],
        )
        .await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;

        let status = h.engine.status_summary().await;
        assert!(status.restart_history.is_empty());
        // Counter stays armed for the next cycle.
        assert_eq!(status.down_counter, 2);
        assert!(!h
            .executor
            .calls()
            .contains(&"systemctl start satisfactory.service".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pkill_fallback_recovers_from_failed_stop() {
        let h = harness(vec![down(), down()], &["systemctl stop"]).await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;

        let calls = h.executor.calls();
        assert!(calls.contains(&"pkill -f FactoryServer".to_string()));
        assert!(calls.contains(&"systemctl start satisfactory.service".to_string()));
        assert_eq!(h.engine.status_summary().await.restart_history.len(), 1);

        let alerts = h.sink.admin.lock().unwrap().clone();
        assert!(alerts
            .iter()
            .any(|(text, urgent)| !urgent && text.contains("restart #1 successful")));
    }

    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn wait_until_ready(&self, _max_wait: Duration) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_still_reports_successful_start() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentStateStore::open(dir.path().join("state.json")));
        let sink = Arc::new(RecordingSink::default());

        let engine = WatchdogEngine::new(
            test_settings(),
            Duration::from_secs(600),
            ScriptedSource::new(vec![down(), down()]),
            RecordingExecutor::new(&[]),
            sink.clone(),
            Arc::new(NeverReady),
            store,
            Arc::new(WatchdogMetrics::new().unwrap()),
        )
        .await;
        engine.patrol_once().await;
        engine.patrol_once().await;

        // The restart itself completed and is on record.
        assert_eq!(engine.status_summary().await.restart_history.len(), 1);

        let alerts = sink.admin.lock().unwrap().clone();
        assert!(alerts
            .iter()
            .any(|(text, urgent)| !urgent && text.contains("restart #1 successful")));
        assert!(alerts
            .iter()
            .any(|(text, urgent)| *urgent && text.contains("readiness was not confirmed")));
    }

    #[tokio::test(start_paused = true)]
    async fn back_online_resets_down_counter_and_announces() {
        let h = harness(vec![down(), healthy()], &[]).await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;

        assert_eq!(h.engine.status_summary().await.down_counter, 0);
        let public = h.sink.public.lock().unwrap().clone();
        assert!(public.iter().any(|t| t.contains("back online")));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_report_resets_period_count() {
        let h = harness(vec![down(), down()], &[]).await;
        h.engine.patrol_once().await;
        h.engine.patrol_once().await;
        assert_eq!(h.engine.status_summary().await.restart_count, 1);

        h.engine.daily_report().await;
        assert_eq!(h.engine.status_summary().await.restart_count, 0);
        // Sequence is lifetime and survives the rollover.
        assert_eq!(h.engine.state.lock().await.restart_sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_restart_bypasses_hourly_budget() {
        let h = harness(vec![healthy()], &[]).await;
        {
            let mut state = h.engine.state.lock().await;
            for seq in 1..=3 {
                state.restart_history.push(RestartEvent {
                    timestamp: Utc::now(),
                    reason: "test".into(),
                    sequence: seq,
                });
            }
        }
        assert!(h.engine.force_restart("operator request").await);
        assert!(h
            .executor
            .calls()
            .contains(&"systemctl start satisfactory.service".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn state_survives_engine_rebuild() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentStateStore::open(dir.path().join("state.json")));

        let engine = WatchdogEngine::new(
            test_settings(),
            Duration::from_secs(600),
            ScriptedSource::new(vec![down(), down()]),
            RecordingExecutor::new(&[]),
            Arc::new(RecordingSink::default()),
            Arc::new(AlwaysReady),
            store.clone(),
            Arc::new(WatchdogMetrics::new().unwrap()),
        )
        .await;
        engine.patrol_once().await;
        engine.patrol_once().await;
        drop(engine);

        let rebuilt = WatchdogEngine::new(
            test_settings(),
            Duration::from_secs(600),
            ScriptedSource::new(vec![]),
            RecordingExecutor::new(&[]),
            Arc::new(RecordingSink::default()),
            Arc::new(AlwaysReady),
            store,
            Arc::new(WatchdogMetrics::new().unwrap()),
        )
        .await;
        let status = rebuilt.status_summary().await;
        assert_eq!(status.restart_history.len(), 1);
        assert_eq!(status.restart_history[0].sequence, 1);
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let mut history = RestartHistory::default();
        for seq in 1..=12 {
            history.push(RestartEvent {
                timestamp: Utc::now(),
                reason: format!("r{seq}"),
                sequence: seq,
            });
        }
        assert_eq!(history.len(), 10);
        let seqs: Vec<u64> = history.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (3..=12).collect::<Vec<u64>>());
        assert_eq!(history.newest().unwrap().sequence, 12);
    }

    #[test]
    fn history_window_count_excludes_old_events() {
        let mut history = RestartHistory::default();
        let now = Utc::now();
        history.push(RestartEvent {
            timestamp: now - ChronoDuration::hours(2),
            reason: "old".into(),
            sequence: 1,
        });
        history.push(RestartEvent {
            timestamp: now - ChronoDuration::minutes(10),
            reason: "recent".into(),
            sequence: 2,
        });
        assert_eq!(history.count_since(now, ChronoDuration::hours(1)), 1);
    }
}
