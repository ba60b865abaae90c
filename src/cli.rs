//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Session monitor - aggregates coding-assistant backend servers on the
/// local network into one live session view.
#[derive(Parser, Debug)]
#[command(name = "session-monitor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MONITOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// UDP discovery port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Stale timeout in seconds
    #[arg(long)]
    pub stale_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MONITOR_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MONITOR_LOG_FORMAT")]
    pub log_format: Option<String>,
}
