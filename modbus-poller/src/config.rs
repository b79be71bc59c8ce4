//! Configuration for connections, discovery and polling.
//!
//! Supports TOML deserialization where every key is optional; durations use
//! humantime notation (`"4s"`, `"250ms"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::DEFAULT_PORT;

/// Lowest polling period a poller accepts, whatever the configuration says.
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(200);

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub connection: ConnectionConfig,
    pub discovery: DiscoveryConfig,
    pub polling: PollingConfig,
}

/// Session pool policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound for establishing a session.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a single request on an open session.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Consecutive link failures after which a session is dropped from the
    /// pool. `0` keeps sessions forever.
    pub max_consecutive_failures: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(4000),
            request_timeout: Duration::from_secs(3),
            max_consecutive_failures: 3,
        }
    }
}

/// Network discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// TCP port probed on every candidate host.
    pub port: u16,

    /// Number of concurrent probe workers.
    pub concurrency: usize,

    /// Probe timeout used when a scan does not name one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            concurrency: 128,
            default_timeout: Duration::from_millis(500),
        }
    }
}

/// Polling cadence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Floor applied to every polling period. Values below
    /// [`MIN_POLL_PERIOD`] are raised to it.
    #[serde(with = "humantime_serde")]
    pub min_period: Duration,

    /// Rate given to newly registered devices.
    #[serde(with = "humantime_serde")]
    pub default_rate: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_period: MIN_POLL_PERIOD,
            default_rate: Duration::from_millis(1000),
        }
    }
}

impl PollingConfig {
    /// Configured floor, never below [`MIN_POLL_PERIOD`].
    pub fn period_floor(&self) -> Duration {
        self.min_period.max(MIN_POLL_PERIOD)
    }
}

impl PollerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
