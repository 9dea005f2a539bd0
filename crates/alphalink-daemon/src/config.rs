//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alphalink_core::session::{PollIntervals, RetryPolicy};
use alphalink_core::settings::NotificationPreferences;
use alphalink_core::{PolicyConfig, SessionConfig};
use anyhow::{Context, Result, bail, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Device polling and retry settings
    #[serde(default)]
    pub device: DeviceConfig,
    /// Notification thresholds
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_format: LogFormat::default() }
    }
}

/// How log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line, for journald or log shippers
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Device settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Enumeration interval
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Per-report read timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Wait for the mic monitor answer before treating it as unknown
    #[serde(default = "default_mic_query_timeout")]
    pub mic_query_timeout_ms: u64,
    /// Poll interval while the headset is online
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Poll interval while the dongle answers but the headset is off
    #[serde(default = "default_offline_poll_interval")]
    pub offline_poll_interval_ms: u64,
    /// Poll interval while recovering from failed polls
    #[serde(default = "default_degraded_poll_interval")]
    pub degraded_poll_interval_ms: u64,
    /// Open/poll failures tolerated while connecting
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Poll failures tolerated while degraded
    #[serde(default = "default_degraded_attempts")]
    pub degraded_attempts: u32,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Non-timeout I/O failures in a row before the handle is reopened
    #[serde(default = "default_transient_failure_limit")]
    pub transient_failure_limit: u32,
    /// First pause after a poll times out; doubles on each further timeout
    #[serde(default = "default_tx_backoff_initial")]
    pub tx_backoff_initial_ms: u64,
    #[serde(default = "default_tx_backoff_max")]
    pub tx_backoff_max_ms: u64,
    /// Commands waiting for the headset before new ones are refused
    #[serde(default = "default_command_queue_limit")]
    pub command_queue_limit: usize,
    /// How long a queued command may wait for acknowledgment
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// How long a disconnected session waits for its device to return
    #[serde(default = "default_session_linger")]
    pub session_linger_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
            read_timeout_ms: default_read_timeout(),
            mic_query_timeout_ms: default_mic_query_timeout(),
            poll_interval_ms: default_poll_interval(),
            offline_poll_interval_ms: default_offline_poll_interval(),
            degraded_poll_interval_ms: default_degraded_poll_interval(),
            connect_attempts: default_connect_attempts(),
            degraded_attempts: default_degraded_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            transient_failure_limit: default_transient_failure_limit(),
            tx_backoff_initial_ms: default_tx_backoff_initial(),
            tx_backoff_max_ms: default_tx_backoff_max(),
            command_queue_limit: default_command_queue_limit(),
            command_timeout_ms: default_command_timeout(),
            session_linger_ms: default_session_linger(),
        }
    }
}

fn default_scan_interval() -> u64 {
    2500
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_mic_query_timeout() -> u64 {
    1200
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_offline_poll_interval() -> u64 {
    5000
}

fn default_degraded_poll_interval() -> u64 {
    2000
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_degraded_attempts() -> u32 {
    3
}

fn default_backoff_initial() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_transient_failure_limit() -> u32 {
    2
}

fn default_tx_backoff_initial() -> u64 {
    4000
}

fn default_tx_backoff_max() -> u64 {
    60_000
}

fn default_command_queue_limit() -> usize {
    64
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_session_linger() -> u64 {
    60_000
}

/// Notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    /// How long a presence change must hold before it is announced
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_low_battery")]
    pub low_battery_percent: u8,
    /// Further alert levels between low and critical
    #[serde(default = "default_battery_warning_levels")]
    pub battery_warning_levels: Vec<u8>,
    #[serde(default = "default_critical_battery")]
    pub critical_battery_percent: u8,
    /// Minimum spacing between repeated low-battery notifications
    #[serde(default = "default_battery_cooldown")]
    pub battery_cooldown_secs: u64,
    /// How long battery alerts are held so close ones go out together
    #[serde(default = "default_battery_batch")]
    pub battery_batch_ms: u64,
    /// Window for counting connect/disconnect changes
    #[serde(default = "default_instability_window")]
    pub instability_window_secs: u64,
    /// Changes within the window reported as one unstable-connection alert
    #[serde(default = "default_instability_changes")]
    pub instability_changes: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            low_battery_percent: default_low_battery(),
            battery_warning_levels: default_battery_warning_levels(),
            critical_battery_percent: default_critical_battery(),
            battery_cooldown_secs: default_battery_cooldown(),
            battery_batch_ms: default_battery_batch(),
            instability_window_secs: default_instability_window(),
            instability_changes: default_instability_changes(),
        }
    }
}

fn default_debounce() -> u64 {
    3000
}

fn default_low_battery() -> u8 {
    20
}

fn default_battery_warning_levels() -> Vec<u8> {
    vec![10]
}

fn default_critical_battery() -> u8 {
    5
}

fn default_battery_cooldown() -> u64 {
    1800
}

fn default_battery_batch() -> u64 {
    1800
}

fn default_instability_window() -> u64 {
    20
}

fn default_instability_changes() -> u32 {
    3
}

/// Timing the session driver needs beyond the state machine's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTiming {
    pub read_timeout: Duration,
    pub mic_query_timeout: Duration,
    pub command_timeout: Duration,
    /// Pause after a poll timeout, doubled up to `tx_backoff_max`
    pub tx_backoff_initial: Duration,
    pub tx_backoff_max: Duration,
    pub command_queue_limit: usize,
    pub linger: Duration,
}

impl Config {
    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns an error naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let d = &self.device;
        let n = &self.notifications;

        ensure!(
            n.low_battery_percent <= 100,
            "notifications.low_battery_percent must be at most 100 (got {})",
            n.low_battery_percent
        );
        ensure!(
            n.critical_battery_percent < n.low_battery_percent,
            "notifications.critical_battery_percent ({}) must be below low_battery_percent ({})",
            n.critical_battery_percent,
            n.low_battery_percent
        );
        ensure!(
            d.degraded_poll_interval_ms < d.poll_interval_ms,
            "device.degraded_poll_interval_ms ({}) must be below poll_interval_ms ({})",
            d.degraded_poll_interval_ms,
            d.poll_interval_ms
        );
        ensure!(d.connect_attempts >= 1, "device.connect_attempts must be at least 1");
        ensure!(d.degraded_attempts >= 1, "device.degraded_attempts must be at least 1");
        ensure!(d.scan_interval_ms > 0, "device.scan_interval_ms must be positive");
        ensure!(d.read_timeout_ms > 0, "device.read_timeout_ms must be positive");
        ensure!(d.mic_query_timeout_ms > 0, "device.mic_query_timeout_ms must be positive");
        ensure!(d.transient_failure_limit >= 1, "device.transient_failure_limit must be at least 1");
        ensure!(d.command_queue_limit >= 1, "device.command_queue_limit must be at least 1");
        ensure!(
            d.tx_backoff_initial_ms <= d.tx_backoff_max_ms,
            "device.tx_backoff_initial_ms ({}) must not exceed tx_backoff_max_ms ({})",
            d.tx_backoff_initial_ms,
            d.tx_backoff_max_ms
        );
        if let Some(level) = n
            .battery_warning_levels
            .iter()
            .find(|l| **l <= n.critical_battery_percent || **l >= n.low_battery_percent)
        {
            bail!(
                "notifications.battery_warning_levels entry {level} must lie between critical_battery_percent ({}) and low_battery_percent ({})",
                n.critical_battery_percent,
                n.low_battery_percent
            );
        }
        ensure!(n.instability_changes >= 2, "notifications.instability_changes must be at least 2");
        Ok(())
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.device.scan_interval_ms)
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let d = &self.device;
        SessionConfig {
            retry: RetryPolicy {
                connect_attempts: d.connect_attempts,
                degraded_attempts: d.degraded_attempts,
                backoff_initial: Duration::from_millis(d.backoff_initial_ms),
                backoff_max: Duration::from_millis(d.backoff_max_ms),
                transient_failure_limit: d.transient_failure_limit,
            },
            intervals: PollIntervals {
                online: Duration::from_millis(d.poll_interval_ms),
                offline: Duration::from_millis(d.offline_poll_interval_ms),
                degraded: Duration::from_millis(d.degraded_poll_interval_ms),
            },
        }
    }

    #[must_use]
    pub fn driver_timing(&self) -> DriverTiming {
        let d = &self.device;
        DriverTiming {
            read_timeout: Duration::from_millis(d.read_timeout_ms),
            mic_query_timeout: Duration::from_millis(d.mic_query_timeout_ms),
            command_timeout: Duration::from_millis(d.command_timeout_ms),
            tx_backoff_initial: Duration::from_millis(d.tx_backoff_initial_ms),
            tx_backoff_max: Duration::from_millis(d.tx_backoff_max_ms),
            command_queue_limit: d.command_queue_limit,
            linger: Duration::from_millis(d.session_linger_ms),
        }
    }

    /// Policy thresholds combined with the user's alert toggles.
    #[must_use]
    pub fn policy_config(&self, alerts: &NotificationPreferences) -> PolicyConfig {
        let n = &self.notifications;
        PolicyConfig {
            debounce: Duration::from_millis(n.debounce_ms),
            low_battery_percent: n.low_battery_percent,
            battery_warning_levels: n.battery_warning_levels.clone(),
            critical_battery_percent: n.critical_battery_percent,
            battery_cooldown: Duration::from_secs(n.battery_cooldown_secs),
            battery_batch: Duration::from_millis(n.battery_batch_ms),
            instability_window: Duration::from_secs(n.instability_window_secs),
            instability_changes: n.instability_changes,
            connection_alerts: alerts.connection_alerts,
            battery_alerts: alerts.battery_alerts,
        }
    }
}

/// Load configuration from the default location, or defaults.
///
/// # Errors
/// Returns an error if the file exists but cannot be read, parsed or
/// validated.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Load configuration from `path`, or defaults if it does not exist.
///
/// # Errors
/// Returns an error if the file exists but cannot be read, parsed or
/// validated.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {path:?}"))?
    } else {
        info!(config_path = ?path, "Config file not found, using defaults");
        Config::default()
    };

    config.validate().with_context(|| format!("Invalid config file: {path:?}"))?;
    Ok(config)
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "alphalink", "Alphalink").context("Could not determine config directory")
}

/// Get the configuration file path.
fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the preferences file path.
///
/// # Errors
/// Returns an error if no home directory can be determined.
pub fn preferences_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("preferences.toml"))
}
