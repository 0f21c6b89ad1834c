//! CLI subcommand implementations.
//!
//! - `check`: validate configuration and system requirements
//! - `config`: generate configuration files
//! - `status`: one-shot performance sample plus stored counters

pub mod check;
pub mod config;
pub mod status;

pub use check::command_check;
pub use config::command_config;
pub use status::command_status;
