//! Prometheus metrics for watchdog observability.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

/// Gauges and counters exported on /metrics.
///
/// Updated by the patrol loop after every sample, so scrapes always see the
/// latest classification inputs next to the counter states.
pub struct WatchdogMetrics {
    registry: Registry,

    pub server_up: IntGauge,
    pub cpu_percent: Gauge,
    pub memory_mb: IntGauge,
    pub estimated_players: IntGauge,

    pub down_counter: IntGauge,
    pub high_cpu_counter: IntGauge,
    pub high_memory_counter: IntGauge,

    pub restarts_total: IntCounter,
    pub patrols_total: IntCounter,
    pub sample_failures_total: IntCounter,
}

impl WatchdogMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let server_up = IntGauge::new(
            "watchdog_server_up",
            "1 when the managed service is active and its process exists",
        )?;
        let cpu_percent = Gauge::new(
            "watchdog_server_cpu_percent",
            "CPU usage of the server process in percent of one core",
        )?;
        let memory_mb = IntGauge::new(
            "watchdog_server_memory_mb",
            "Resident memory of the server process in megabytes",
        )?;
        let estimated_players = IntGauge::new(
            "watchdog_estimated_players",
            "Estimated connected players from game-port connections",
        )?;
        let down_counter = IntGauge::new(
            "watchdog_down_counter",
            "Consecutive patrol samples with the server unavailable",
        )?;
        let high_cpu_counter = IntGauge::new(
            "watchdog_high_cpu_counter",
            "Consecutive patrol samples above the CPU trip point",
        )?;
        let high_memory_counter = IntGauge::new(
            "watchdog_high_memory_counter",
            "Consecutive patrol samples inside the memory warning band",
        )?;
        let restarts_total = IntCounter::new(
            "watchdog_restarts_total",
            "Automated restarts completed since daemon start",
        )?;
        let patrols_total = IntCounter::new(
            "watchdog_patrols_total",
            "Patrol cycles executed since daemon start",
        )?;
        let sample_failures_total = IntCounter::new(
            "watchdog_sample_failures_total",
            "Patrol cycles skipped because sampling failed",
        )?;

        registry.register(Box::new(server_up.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(memory_mb.clone()))?;
        registry.register(Box::new(estimated_players.clone()))?;
        registry.register(Box::new(down_counter.clone()))?;
        registry.register(Box::new(high_cpu_counter.clone()))?;
        registry.register(Box::new(high_memory_counter.clone()))?;
        registry.register(Box::new(restarts_total.clone()))?;
        registry.register(Box::new(patrols_total.clone()))?;
        registry.register(Box::new(sample_failures_total.clone()))?;

        Ok(Self {
            registry,
            server_up,
            cpu_percent,
            memory_mb,
            estimated_players,
            down_counter,
            high_cpu_counter,
            high_memory_counter,
            restarts_total,
            patrols_total,
            sample_failures_total,
        })
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
