//! Configuration loading and management.
//!
//! Structured configuration for roomsync:
//! - Redis connection settings
//! - Key prefix shared by every process on the same store
//! - Idle reaping cadence and threshold
//!
//! Hosts that embed the crate may build [`Config`] programmatically or load
//! it from a TOML file with [`Config::load`].

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Synchronization core settings.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Redis connection settings.
///
/// The URL is handed to the client library unchanged, so every scheme it
/// understands works here (`redis://`, `rediss://`, auth, db index).
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "defaults::redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: defaults::redis_url(),
        }
    }
}

/// Settings for the room manager.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Key prefix for every room key on the store. All processes that should
    /// see each other's rooms must agree on this.
    #[serde(default = "defaults::prefix")]
    pub prefix: String,

    /// Seconds an initialized, callback-free consumer room may linger before
    /// the reaper destroys it.
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds between reaper sweeps.
    #[serde(default = "defaults::check_interval")]
    pub check_interval: u64,

    /// History cap applied when the stateless publish path is called without
    /// explicit options. 0 disables history on that path.
    #[serde(default)]
    pub default_history_length: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefix: defaults::prefix(),
            idle_timeout: defaults::idle_timeout(),
            check_interval: defaults::check_interval(),
            default_history_length: 0,
        }
    }
}

impl SyncConfig {
    /// Idle threshold as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Reaper sweep interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }
}

/// Default value functions for serde.
mod defaults {
    pub fn redis_url() -> String {
        "redis://127.0.0.1:6379/".to_string()
    }

    pub fn prefix() -> String {
        "room".to_string()
    }

    pub fn idle_timeout() -> u64 {
        300
    }

    pub fn check_interval() -> u64 {
        60
    }
}
