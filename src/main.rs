//! Satisfactory dedicated server watchdog daemon.
//!
//! Samples the managed server's health once per patrol interval, classifies
//! fault conditions against configurable thresholds and drives a
//! rate-limited automated recovery procedure, with an HTTP endpoint for
//! operators and Prometheus.

mod alerts;
mod cli;
mod commands;
mod config;
mod executor;
mod handlers;
mod metrics;
mod perf;
mod ratelimit;
mod readiness;
mod state;
mod store;
mod validator;
mod watchdog;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, Level};

use crate::alerts::{AlertSink, LogAlertSink};
use crate::cli::{Args, Commands, ConfigFormat, LogLevel};
use crate::commands::{command_check, command_config, command_status};
use crate::config::{
    resolve_config, validate_effective_config, Config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
    DEFAULT_STATE_FILE,
};
use crate::executor::{CommandExecutor, SystemCommandExecutor};
use crate::handlers::{health_handler, metrics_handler, restart_handler, status_handler};
use crate::metrics::WatchdogMetrics;
use crate::perf::{PerformanceSource, ProcPerformanceSource};
use crate::ratelimit::RateLimiter;
use crate::readiness::{PerformanceReadinessProbe, ReadinessProbe};
use crate::state::{AppState, SharedState};
use crate::store::PersistentStateStore;
use crate::watchdog::{WatchdogEngine, WatchdogSettings};

/// Initializes tracing logging subsystem with configured log level
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR, // Off not fully supported, use ERROR as minimal
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// Prints the effective merged configuration.
fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        if args.show_config {
            return show_config(&config, args.config_format.clone());
        }
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        let config = resolve_config(&args)?;
        match command {
            Commands::Check {
                proc,
                systemctl,
                state,
                all,
            } => return command_check(*proc, *systemctl, *state, *all, &config),
            Commands::Config {
                output,
                format,
                commented,
            } => return command_config(output.clone(), format.clone(), *commented),
            Commands::Status { format } => return command_status(format.clone(), &config).await,
        }
    }

    // Load configuration for daemon mode
    let config = resolve_config(&args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&args);

    info!("Starting satisfactory-watchdog");

    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    // Wire the watchdog components
    let settings = WatchdogSettings::from_config(&config);
    let store = Arc::new(PersistentStateStore::open(
        config
            .state_file
            .clone()
            .unwrap_or_else(|| DEFAULT_STATE_FILE.into()),
    ));
    let metrics = Arc::new(WatchdogMetrics::new()?);
    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor);
    let source: Arc<dyn PerformanceSource> = Arc::new(ProcPerformanceSource::new(
        settings.process_names.clone(),
        settings.service_unit.clone(),
        config.game_port.unwrap_or(7777),
        config.player_conn_baseline.unwrap_or(5),
        settings.command_timeout,
        executor.clone(),
    ));
    let alert_sink: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let probe: Arc<dyn ReadinessProbe> =
        Arc::new(PerformanceReadinessProbe::new(source.clone()));
    let alert_cooldown =
        Duration::from_secs(config.alert_cooldown_minutes.unwrap_or(10).max(0) as u64 * 60);

    let engine = Arc::new(
        WatchdogEngine::new(
            settings,
            alert_cooldown,
            source,
            executor,
            alert_sink,
            probe,
            store.clone(),
            metrics.clone(),
        )
        .await,
    );
    engine.announce_online().await;

    let restart_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_calls.unwrap_or(3),
        Duration::from_secs(config.rate_limit_window_secs.unwrap_or(10)),
    ));
    let app_state: SharedState = Arc::new(AppState {
        engine: engine.clone(),
        metrics,
        restart_limiter,
        started_at: Instant::now(),
    });

    // Timers observe this flag between ticks only, so an in-flight patrol or
    // restart always runs to completion.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Patrol timer
    let patrol_engine = engine.clone();
    let mut patrol_shutdown = shutdown_rx.clone();
    let patrol_every = Duration::from_secs(config.patrol_interval_secs.unwrap_or(60));
    let patrol_task = tokio::spawn(async move {
        let mut int = interval(patrol_every);
        info!("Patrol task started with {}s interval", patrol_every.as_secs());
        loop {
            tokio::select! {
                _ = int.tick() => {
                    patrol_engine.patrol_once().await;
                }
                _ = patrol_shutdown.changed() => {
                    info!("Patrol task stopping");
                    break;
                }
            }
        }
    });

    // Daily report timer; the immediate first tick is swallowed so the
    // report fires one full period after startup.
    let report_engine = engine.clone();
    let mut report_shutdown = shutdown_rx;
    let report_every =
        Duration::from_secs(config.report_interval_hours.unwrap_or(24) * 3600);
    let report_task = tokio::spawn(async move {
        let mut int = interval(report_every);
        int.tick().await;
        loop {
            tokio::select! {
                _ = int.tick() => {
                    report_engine.daily_report().await;
                }
                _ = report_shutdown.changed() => {
                    break;
                }
            }
        }
    });

    // Setup graceful shutdown signal handlers
    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    // Configure HTTP server routes and start listening
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let mut app = Router::new()
        .route("/status", get(status_handler))
        .route("/restart", post(restart_handler));

    if config.enable_health.unwrap_or(true) {
        app = app.route("/health", get(health_handler));
    }
    if config.enable_metrics.unwrap_or(true) {
        app = app.route("/metrics", get(metrics_handler));
    }

    let app = app.with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    info!(
        "satisfactory-watchdog listening on http://{}:{}",
        bind_ip_str, port
    );

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, exiting...");
        }
    }

    // Stop the timers, let any in-flight cycle finish, then flush state.
    let _ = shutdown_tx.send(true);
    let _ = patrol_task.await;
    let _ = report_task.await;

    engine.flush().await;
    if let Err(e) = store.flush().await {
        error!("Final state flush failed: {e:#}");
    }

    info!("satisfactory-watchdog stopped gracefully");
    Ok(())
}
