//! Configuration management for satisfactory-watchdog.
//!
//! Config values come from three layers with fixed precedence:
//! CLI arguments > config file (YAML/JSON/TOML) > built-in defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::Args;

/// Default bind address for the operator HTTP endpoint.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
/// Default HTTP port for the operator endpoint.
pub const DEFAULT_PORT: u16 = 9216;
/// Default systemd unit of the managed server.
pub const DEFAULT_SERVICE_UNIT: &str = "satisfactory.service";
/// Default persistent state file path.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/satisfactory-watchdog/state.json";

/// Enhanced configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Managed service
    pub service_unit: Option<String>,
    /// Process names that identify the game server in /proc
    pub process_names: Option<Vec<String>>,
    /// Game port used to estimate connected players from /proc/net/tcp
    pub game_port: Option<u16>,
    /// Established connections the server keeps open without any player
    pub player_conn_baseline: Option<usize>,

    // Fault thresholds
    pub server_down_threshold: Option<u32>,
    pub memory_leak_threshold_mb: Option<u64>,
    pub continuous_high_cpu: Option<u32>,
    pub cpu_trip_percent: Option<f64>,

    // Recovery pacing
    pub max_restarts_per_hour: Option<usize>,
    pub restart_settle_secs: Option<u64>,
    pub ready_max_wait_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,

    // Alerting
    pub alert_cooldown_minutes: Option<i64>,

    // Interactive trigger rate limiting
    pub rate_limit_max_calls: Option<usize>,
    pub rate_limit_window_secs: Option<u64>,

    // Scheduling
    pub patrol_interval_secs: Option<u64>,
    pub report_interval_hours: Option<u64>,

    // Persistence
    pub state_file: Option<PathBuf>,

    // Feature flags
    pub enable_health: Option<bool>,
    pub enable_metrics: Option<bool>,
    pub enable_tuning: Option<bool>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            service_unit: Some(DEFAULT_SERVICE_UNIT.to_string()),
            process_names: Some(vec![
                "FactoryServer".into(),
                "UE4Server".into(),
                "UnrealServer".into(),
            ]),
            game_port: Some(7777),
            player_conn_baseline: Some(5),
            server_down_threshold: Some(2),
            memory_leak_threshold_mb: Some(12000),
            continuous_high_cpu: Some(5),
            cpu_trip_percent: Some(95.0),
            max_restarts_per_hour: Some(3),
            restart_settle_secs: Some(15),
            ready_max_wait_secs: Some(120),
            command_timeout_secs: Some(30),
            alert_cooldown_minutes: Some(10),
            rate_limit_max_calls: Some(3),
            rate_limit_window_secs: Some(10),
            patrol_interval_secs: Some(60),
            report_interval_hours: Some(24),
            state_file: Some(PathBuf::from(DEFAULT_STATE_FILE)),
            enable_health: Some(true),
            enable_metrics: Some(true),
            enable_tuning: Some(true),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    /// Memory warning threshold: 80% of the hard limit.
    pub fn memory_warning_threshold_mb(&self) -> u64 {
        let hard = self.memory_leak_threshold_mb.unwrap_or(12000);
        (hard as f64 * 0.8) as u64
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(unit) = cfg.service_unit.as_deref() {
        if !unit.ends_with(".service") {
            return Err(format!(
                "service_unit '{}' must end with '.service'",
                unit
            )
            .into());
        }
    }

    if cfg.server_down_threshold == Some(0) {
        return Err("server_down_threshold must be >= 1".into());
    }
    if cfg.continuous_high_cpu == Some(0) {
        return Err("continuous_high_cpu must be >= 1".into());
    }
    if cfg.max_restarts_per_hour == Some(0) {
        return Err("max_restarts_per_hour must be >= 1".into());
    }
    if cfg.patrol_interval_secs == Some(0) {
        return Err("patrol_interval_secs must be >= 1".into());
    }
    if cfg.report_interval_hours == Some(0) {
        return Err("report_interval_hours must be >= 1".into());
    }
    if cfg.command_timeout_secs == Some(0) {
        return Err("command_timeout_secs must be >= 1".into());
    }
    if cfg.rate_limit_window_secs == Some(0) {
        return Err("rate_limit_window_secs must be >= 1".into());
    }

    if let Some(names) = &cfg.process_names {
        if names.is_empty() {
            return Err("process_names must contain at least one entry".into());
        }
    }

    if let Some(pct) = cfg.cpu_trip_percent {
        if !(0.0..=100.0).contains(&pct) {
            return Err(format!("cpu_trip_percent {} out of range 0..=100", pct).into());
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// Precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if let Some(unit) = &args.service_unit {
        config.service_unit = Some(unit.clone());
    }
    if let Some(path) = &args.state_file {
        config.state_file = Some(path.clone());
    }
    if args.patrol_interval_secs.is_some() {
        config.patrol_interval_secs = args.patrol_interval_secs;
    }
    if args.server_down_threshold.is_some() {
        config.server_down_threshold = args.server_down_threshold;
    }
    if args.memory_leak_threshold_mb.is_some() {
        config.memory_leak_threshold_mb = args.memory_leak_threshold_mb;
    }
    if args.continuous_high_cpu.is_some() {
        config.continuous_high_cpu = args.continuous_high_cpu;
    }
    if args.max_restarts_per_hour.is_some() {
        config.max_restarts_per_hour = args.max_restarts_per_hour;
    }

    // Feature flags
    if args.disable_health {
        config.enable_health = Some(false);
    }
    if args.disable_metrics {
        config.enable_metrics = Some(false);
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        // Try default locations
        let defaults = [
            "/etc/satisfactory-watchdog/config.yaml",
            "/etc/satisfactory-watchdog/config.yml",
            "/etc/satisfactory-watchdog/config.json",
            "./satisfactory-watchdog.yaml",
            "./satisfactory-watchdog.yml",
            "./satisfactory-watchdog.json",
        ];

        defaults
            .iter()
            .find(|p| Path::new(p).exists())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(""))
    };

    if !path.exists() || path.to_string_lossy().is_empty() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(validate_effective_config(&cfg).is_ok());
    }

    #[test]
    fn rejects_unit_without_service_suffix() {
        let cfg = Config {
            service_unit: Some("satisfactory".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_thresholds() {
        let cfg = Config {
            server_down_threshold: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());

        let cfg = Config {
            continuous_high_cpu: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        let cfg = Config {
            report_interval_hours: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());

        let cfg = Config {
            command_timeout_secs: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());

        let cfg = Config {
            rate_limit_window_secs: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn memory_warning_threshold_is_80_percent() {
        let cfg = Config {
            memory_leak_threshold_mb: Some(12000),
            ..Config::default()
        };
        assert_eq!(cfg.memory_warning_threshold_mb(), 9600);
    }

    #[test]
    fn yaml_round_trip_preserves_thresholds() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.server_down_threshold, Some(2));
        assert_eq!(back.memory_leak_threshold_mb, Some(12000));
        assert_eq!(back.continuous_high_cpu, Some(5));
    }
}
