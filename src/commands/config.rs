//! Configuration file generation command implementation.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::Config;

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("satisfactory-watchdog.yaml"),
    };

    let content = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
        ConfigFormat::Toml => toml::to_string_pretty(&config)?,
        ConfigFormat::Yaml => {
            let mut content = serde_yaml::to_string(&config)?;
            if commented {
                content = add_config_comments(content);
            }
            content
        }
    };

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Satisfactory Watchdog Configuration
# ===================================
#
# Operator Endpoint
# -----------------
# bind: "127.0.0.1"             # Bind IP for the HTTP endpoint
# port: 9216                    # HTTP port
#
# Managed Service
# ---------------
# service_unit: "satisfactory.service"  # systemd unit to watch
# process_names:                # Process names that identify the server
#   - FactoryServer
#   - UE4Server
#   - UnrealServer
# game_port: 7777               # Game port for player estimation
# player_conn_baseline: 5       # Connections the idle server keeps open
#
# Fault Thresholds
# ----------------
# server_down_threshold: 2      # Consecutive down checks before restart
# memory_leak_threshold_mb: 12000  # Hard memory limit (restart same cycle)
# continuous_high_cpu: 5        # Consecutive high-CPU checks before restart
# cpu_trip_percent: 95.0        # CPU percent that counts as high
#
# Recovery Pacing
# ---------------
# max_restarts_per_hour: 3      # Automated restart budget per trailing hour
# restart_settle_secs: 15       # Wait between stop and start
# ready_max_wait_secs: 120      # Max wait for readiness confirmation
# command_timeout_secs: 30      # Hard timeout for host commands
#
# Alerting
# --------
# alert_cooldown_minutes: 10    # Per-category alert suppression window
#
# Manual Restart Rate Limit
# -------------------------
# rate_limit_max_calls: 3       # Allowed POST /restart calls per window
# rate_limit_window_secs: 10    # Rate limit window
#
# Scheduling
# ----------
# patrol_interval_secs: 60      # Health check cadence
# report_interval_hours: 24     # Daily report cadence
#
# Persistence
# -----------
# state_file: "/var/lib/satisfactory-watchdog/state.json"
#
# Feature Flags
# -------------
# enable_health: true           # Enable /health endpoint
# enable_metrics: true          # Enable /metrics endpoint
# enable_tuning: true           # Apply renice/ionice/taskset after restart
#
# Logging
# -------
# log_level: "info"             # off, error, warn, info, debug, trace
"#;

    format!("{comments}\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_parseable_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        command_config(Some(path.clone()), ConfigFormat::Yaml, false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let parsed: Config = serde_yaml::from_str(&content).unwrap();
        assert_eq!(parsed.game_port, Some(7777));
    }

    #[test]
    fn commented_yaml_still_parses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        command_config(Some(path.clone()), ConfigFormat::Yaml, true).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let parsed: Config = serde_yaml::from_str(&content).unwrap();
        assert_eq!(parsed.server_down_threshold, Some(2));
    }

    #[test]
    fn toml_output_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        command_config(Some(path.clone()), ConfigFormat::Toml, false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed.memory_leak_threshold_mb, Some(12000));
    }
}
