//! Application configuration loading from file and environment variables.

use depot_db::{OverflowPolicy, PoolConfig};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database file settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Schema migration settings.
    #[serde(default)]
    pub migrations: MigrationSettings,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// Connection pool configuration. Durations are in (fractional) seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of idle connections kept by the pool.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// How long a checkout waits for an idle connection.
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: f64,

    /// Idle connections older than this are replaced.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: f64,

    /// Idle connections older than this are probed before reuse.
    #[serde(default = "default_health_check_idle_secs")]
    pub health_check_idle_secs: f64,

    /// `elastic` opens extra connections under load; `strict` fails the
    /// checkout instead.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Migration configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrationSettings {
    /// Version to migrate to at startup. Latest known when unset.
    #[serde(default)]
    pub target_version: Option<u32>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "depot_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "depot.db".to_string()
}

fn default_pool_size() -> usize {
    5
}

fn default_checkout_timeout_secs() -> f64 {
    30.0
}

fn default_max_idle_secs() -> f64 {
    300.0
}

fn default_health_check_idle_secs() -> f64 {
    60.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            max_idle_secs: default_max_idle_secs(),
            health_check_idle_secs: default_health_check_idle_secs(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Negative, NaN, and out-of-range values are errors rather than zero.
fn secs(key: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        tracing::warn!(key, value, "rejecting invalid duration in pool settings");
        ConfigError::InvalidDuration { key, value }
    })
}

impl PoolSettings {
    /// Converts file-level settings into the pool's runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidDuration` if a seconds value cannot be
    /// represented as a duration.
    pub fn to_pool_config(&self) -> Result<PoolConfig, ConfigError> {
        let checkout_timeout = secs("pool.checkout_timeout_secs", self.checkout_timeout_secs)?;
        Ok(PoolConfig {
            pool_size: self.size,
            checkout_timeout,
            max_idle_time: secs("pool.max_idle_secs", self.max_idle_secs)?,
            health_check_idle_threshold: secs(
                "pool.health_check_idle_secs",
                self.health_check_idle_secs,
            )?,
            busy_timeout: checkout_timeout,
            overflow: self.overflow,
            ..PoolConfig::default()
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A seconds value is negative, NaN, or too large.
    #[error("invalid duration for {key}: {value}")]
    InvalidDuration { key: &'static str, value: f64 },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `DEPOT_DB_PATH` overrides `database.path`
/// - `DEPOT_POOL_SIZE` overrides `pool.size`
/// - `DEPOT_CHECKOUT_TIMEOUT_SECS` overrides `pool.checkout_timeout_secs`
/// - `DEPOT_MAX_IDLE_SECS` overrides `pool.max_idle_secs`
/// - `DEPOT_LOG_LEVEL` overrides `logging.level`
/// - `DEPOT_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = var("DEPOT_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(size) = var("DEPOT_POOL_SIZE") {
        if let Ok(parsed) = size.parse() {
            config.pool.size = parsed;
        }
    }
    if let Some(timeout) = var("DEPOT_CHECKOUT_TIMEOUT_SECS") {
        if let Ok(parsed) = timeout.parse() {
            config.pool.checkout_timeout_secs = parsed;
        }
    }
    if let Some(idle) = var("DEPOT_MAX_IDLE_SECS") {
        if let Ok(parsed) = idle.parse() {
            config.pool.max_idle_secs = parsed;
        }
    }
    if let Some(level) = var("DEPOT_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("DEPOT_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
