//! CLI arguments and subcommands for satisfactory-watchdog.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "satisfactory-watchdog",
    about = "Watchdog daemon for a systemd-managed Satisfactory dedicated server",
    long_about = "Watchdog daemon for a systemd-managed Satisfactory dedicated server.\n\n\
                  Samples process health once per patrol interval, classifies fault\n\
                  conditions against configurable thresholds and drives a rate-limited\n\
                  automated stop/start recovery procedure with operator alerts.",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port for the operator endpoint
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// systemd unit of the managed game server
    #[arg(long)]
    pub service_unit: Option<String>,

    /// Path to the persistent state file
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Patrol (sampling) interval in seconds
    #[arg(long)]
    pub patrol_interval_secs: Option<u64>,

    /// Consecutive down samples before a restart is requested
    #[arg(long)]
    pub server_down_threshold: Option<u32>,

    /// Memory hard limit in MB (single-sample restart trip)
    #[arg(long)]
    pub memory_leak_threshold_mb: Option<u64>,

    /// Consecutive high-CPU samples before a restart is requested
    #[arg(long)]
    pub continuous_high_cpu: Option<u32>,

    /// Maximum automated restarts within a trailing hour
    #[arg(long)]
    pub max_restarts_per_hour: Option<usize>,

    /// Disable /health endpoint
    #[arg(long)]
    pub disable_health: bool,

    /// Disable /metrics endpoint and internal metrics
    #[arg(long)]
    pub disable_metrics: bool,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and system requirements
    Check {
        /// Check /proc filesystem access
        #[arg(long)]
        proc: bool,

        /// Check systemctl availability
        #[arg(long)]
        systemctl: bool,

        /// Check state file writability
        #[arg(long)]
        state: bool,

        /// Check all system requirements
        #[arg(long)]
        all: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Take one performance sample and print it with the stored counters
    Status {
        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },
}
