//! Configuration management
//!
//! Layering: built-in defaults, then an optional YAML file, then the
//! `MONITOR_*` environment variables. Invalid environment values
//! (non-integer or non-positive) fall back to whatever the lower layers
//! produced, without failing startup.

use std::path::Path;
use std::time::Duration;
use std::env;

use backon::{BackoffBuilder, ExponentialBuilder};
use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// UDP discovery port variable.
pub const ENV_PORT: &str = "MONITOR_PORT";
/// Stale timeout variable (seconds).
pub const ENV_TIMEOUT: &str = "MONITOR_TIMEOUT";
/// Long-running threshold variable (minutes).
pub const ENV_LONG_RUNNING: &str = "MONITOR_LONG_RUNNING";
/// Notification toggle variable (`"0"` disables).
pub const ENV_NOTIFICATIONS: &str = "MONITOR_NOTIFICATIONS";
/// Verbose logging variable (`"1"` enables).
pub const ENV_DEBUG: &str = "MONITOR_DEBUG";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing env overrides.
    /// Loaded in order, later files override earlier. Missing files are
    /// skipped.
    pub env_files: Vec<String>,
    /// Discovery listener configuration
    pub discovery: DiscoveryConfig,
    /// Aggregation timing and limits
    pub aggregator: AggregatorConfig,
    /// Event stream reconnection configuration
    pub stream: StreamConfig,
    /// Desktop notification toggle surfaced to presenters
    pub notifications: NotificationConfig,
}

/// Discovery listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port announcements arrive on
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { port: 41234 }
    }
}

/// Aggregation timing and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// A server with no announcement for longer than this is removed
    #[serde(with = "humantime_serde")]
    pub stale_timeout: Duration,
    /// Period of the per-server snapshot reconciliation
    #[serde(with = "humantime_serde")]
    pub session_refresh_interval: Duration,
    /// Sessions older than this count as long-running
    #[serde(with = "humantime_serde")]
    pub long_running_threshold: Duration,
    /// Per-HTTP-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Ring-buffer capacity per notification subscriber; the oldest entry
    /// is dropped when a slow subscriber falls this far behind
    pub notification_buffer: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(120),
            session_refresh_interval: Duration::from_secs(5),
            long_running_threshold: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(10),
            notification_buffer: 256,
        }
    }
}

/// Event stream reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Consecutive failed attempts before the supervisor gives up
    pub max_attempts: usize,
    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Reconnect delay ceiling
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    /// Reconnect delay schedule: `min(base * 2^i, cap)`, one entry per
    /// allowed attempt, without jitter. Exhaustion of the iterator is the
    /// signal to stop retrying.
    #[must_use]
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + Send {
        ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(self.backoff_base)
            .with_max_delay(self.backoff_cap)
            .with_max_times(self.max_attempts)
            .build()
    }
}

/// Desktop notification toggle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Whether presenters should dispatch desktop notifications
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given config file does not exist
    /// or cannot be parsed. Environment values never fail the load.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_env_overrides(|name| env::var(name).ok());

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Apply `MONITOR_*` overrides from a variable lookup.
    ///
    /// Split out from [`Config::load`] so tests can drive it without
    /// touching the process environment.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = get(ENV_PORT) {
            match parse_positive(&raw).and_then(|v| u16::try_from(v).ok()) {
                Some(port) => self.discovery.port = port,
                None => tracing::debug!(value = %raw, "Ignoring invalid {ENV_PORT}"),
            }
        }

        if let Some(raw) = get(ENV_TIMEOUT) {
            match parse_positive(&raw) {
                Some(secs) => self.aggregator.stale_timeout = Duration::from_secs(secs),
                None => tracing::debug!(value = %raw, "Ignoring invalid {ENV_TIMEOUT}"),
            }
        }

        if let Some(raw) = get(ENV_LONG_RUNNING) {
            match parse_positive(&raw) {
                Some(minutes) => {
                    self.aggregator.long_running_threshold = Duration::from_secs(minutes * 60);
                }
                None => tracing::debug!(value = %raw, "Ignoring invalid {ENV_LONG_RUNNING}"),
            }
        }

        if let Some(raw) = get(ENV_NOTIFICATIONS) {
            self.notifications.enabled = raw != "0";
        }
    }
}

/// Whether `MONITOR_DEBUG=1` asks for verbose logging.
#[must_use]
pub fn debug_enabled() -> bool {
    env::var(ENV_DEBUG).is_ok_and(|v| v == "1")
}

fn parse_positive(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .map(|v| v as u64)
}
