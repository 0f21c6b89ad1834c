//! One-shot status command implementation.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::ConfigFormat;
use crate::config::{Config, DEFAULT_SERVICE_UNIT, DEFAULT_STATE_FILE};
use crate::executor::SystemCommandExecutor;
use crate::perf::{PerformanceSample, PerformanceSource, ProcPerformanceSource};
use crate::store::PersistentStateStore;
use crate::watchdog::{WatchdogState, WATCHDOG_STATE_KEY};

#[derive(Serialize)]
struct StatusReport {
    sample: PerformanceSample,
    watchdog: WatchdogState,
}

/// Takes one performance sample and prints it with the stored counters.
pub async fn command_status(
    format: ConfigFormat,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = ProcPerformanceSource::new(
        config.process_names.clone().unwrap_or_default(),
        config
            .service_unit
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVICE_UNIT.to_string()),
        config.game_port.unwrap_or(7777),
        config.player_conn_baseline.unwrap_or(5),
        Duration::from_secs(config.command_timeout_secs.unwrap_or(30)),
        Arc::new(SystemCommandExecutor),
    );
    let sample = source.sample().await?;

    let store = PersistentStateStore::open(
        config
            .state_file
            .clone()
            .unwrap_or_else(|| DEFAULT_STATE_FILE.into()),
    );
    let watchdog = store
        .get_as::<WatchdogState>(WATCHDOG_STATE_KEY)
        .await
        .unwrap_or_default();

    let report = StatusReport { sample, watchdog };
    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&report)?,
        ConfigFormat::Toml => toml::to_string_pretty(&report)?,
        ConfigFormat::Yaml => serde_yaml::to_string(&report)?,
    };
    println!("{rendered}");
    Ok(())
}
