//! Persistent application configuration model and defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Root configuration persisted to `tagsync.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Remote statistics endpoint.
    pub remote: RemoteConfig,
    #[serde(default)]
    /// Worker queue and throttling behavior.
    pub sync: SyncConfig,
    #[serde(default)]
    /// Local cache location.
    pub storage: StorageConfig,
    #[serde(default)]
    /// Idle-time refresh of stale cache rows.
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote endpoint settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Account identifier embedded in every lookup URL.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// The current endpoint serves a chain that fails validation, so this stays on by default.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    /// Whole-request timeout. Unset leaves the transport defaults in place.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Worker queue and throttling settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    /// User whose daily likes are the scoring baseline.
    #[serde(default)]
    pub current_user: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum characters of the joined name list sent per call.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Outbound calls allowed at once; further chunks wait in the worker.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Local cache settings.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Overrides the platform data directory location.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Stale-row refresh run from the worker's idle branch.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after_secs(&self) -> i64 {
        self.stale_after_days.saturating_mul(24 * 60 * 60) as i64
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            account_id: default_account_id(),
            accept_invalid_certs: true,
            request_timeout_secs: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            current_user: None,
            poll_interval_ms: default_poll_interval_ms(),
            chunk_chars: default_chunk_chars(),
            cooldown_secs: default_cooldown_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_maintenance_interval_secs(),
            stale_after_days: default_stale_after_days(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Clamps values the worker cannot operate with.
pub fn sanitize_config(config: Config) -> Config {
    Config {
        sync: SyncConfig {
            poll_interval_ms: config.sync.poll_interval_ms.clamp(50, 60_000),
            chunk_chars: config.sync.chunk_chars.max(1),
            max_in_flight: config.sync.max_in_flight.max(1),
            ..config.sync
        },
        maintenance: MaintenanceConfig {
            interval_secs: config.maintenance.interval_secs.max(1),
            batch_limit: config.maintenance.batch_limit.max(1),
            ..config.maintenance
        },
        ..config
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tagsync.toml"))
}

pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tagsync").join("hashtags.db"))
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://fc.inssist.com".to_string()
}

fn default_account_id() -> String {
    "1781835001".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_chunk_chars() -> usize {
    100
}

fn default_cooldown_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_in_flight() -> usize {
    4
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

fn default_stale_after_days() -> u64 {
    30
}

fn default_batch_limit() -> usize {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
