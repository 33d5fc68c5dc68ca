//! # Worker Configuration
//!
//! Typed configuration for the processing worker. Values are layered by
//! [`ConfigManager`]: built-in defaults, optional `config/worker.toml`, an
//! optional per-environment file, `TRAIL__SECTION__KEY` environment
//! overrides, and finally the variables earlier deployments used
//! (`POSTGRES_CONNECTION_URL`, `POSTGRES_LISTEN_CHANNEL`, `PROCESS_INTERVAL`).
//!
//! Everything is validated before a scheduler is constructed; the engine and
//! scheduler assume a valid configuration.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trail_progress_worker::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().processing.batch_size;
//! let interval = manager.config().processing.interval;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{defaults, limits};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::{ConfigManager, ConfigSources};

/// Root configuration
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Database connection and notification settings
    pub database: DatabaseConfig,

    /// Claiming, batching and scheduling settings
    pub processing: ProcessingConfig,
}

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Channel the ingestion side notifies when new work lands
    pub listen_channel: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/trail_progress_development".to_string(),
            max_connections: defaults::MAX_CONNECTIONS,
            acquire_timeout_seconds: defaults::ACQUIRE_TIMEOUT_SECONDS,
            listen_channel: defaults::LISTEN_CHANNEL.to_string(),
        }
    }
}

/// Claiming and scheduling settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Fallback poll period; notifications usually wake the worker sooner
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Items claimed per transaction
    pub batch_size: usize,
    /// Scheduler/engine pairs run by this process
    pub worker_concurrency: usize,
    /// Attempts per batch before a transient conflict becomes fatal
    pub max_attempts: u32,
    /// Age after which an unfinished claim may be taken over
    #[serde(with = "duration_str")]
    pub claim_lease: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            interval: defaults::PROCESS_INTERVAL,
            batch_size: defaults::BATCH_SIZE,
            worker_concurrency: defaults::WORKER_CONCURRENCY,
            max_attempts: defaults::MAX_ATTEMPTS,
            claim_lease: defaults::CLAIM_LEASE,
        }
    }
}

impl WorkerConfig {
    /// Reject values the engine and scheduler cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.processing.validate()
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.url.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("database.url".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.max_connections,
                "must be at least 1",
            ));
        }
        if !is_plain_identifier(&self.listen_channel) {
            return Err(ConfigurationError::invalid_value(
                "database.listen_channel",
                &self.listen_channel,
                "must be a non-empty identifier of letters, digits and underscores",
            ));
        }
        Ok(())
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "processing.interval",
                format_duration(self.interval),
                "must be greater than zero",
            ));
        }
        if self.batch_size == 0 || self.batch_size > limits::MAX_BATCH_SIZE {
            return Err(ConfigurationError::invalid_value(
                "processing.batch_size",
                self.batch_size,
                format!("must be between 1 and {}", limits::MAX_BATCH_SIZE),
            ));
        }
        if self.worker_concurrency == 0 || self.worker_concurrency > limits::MAX_WORKER_CONCURRENCY
        {
            return Err(ConfigurationError::invalid_value(
                "processing.worker_concurrency",
                self.worker_concurrency,
                format!("must be between 1 and {}", limits::MAX_WORKER_CONCURRENCY),
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > limits::MAX_ATTEMPTS_CEILING {
            return Err(ConfigurationError::invalid_value(
                "processing.max_attempts",
                self.max_attempts,
                format!("must be between 1 and {}", limits::MAX_ATTEMPTS_CEILING),
            ));
        }
        if self.claim_lease.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "processing.claim_lease",
                format_duration(self.claim_lease),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a humane duration: `30`, `500ms`, `30s`, `5m`, `1h`, `1m30s`, `1.5h`
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let text = input.trim();
    if text.is_empty() {
        return Err(ConfigurationError::invalid_duration(input, "empty value"));
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total_seconds = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(ConfigurationError::invalid_duration(input, "expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| ConfigurationError::invalid_duration(input, "malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(ConfigurationError::invalid_duration(input, "missing unit")),
            unit => {
                return Err(ConfigurationError::invalid_duration(
                    input,
                    format!("unknown unit '{unit}'"),
                ))
            }
        };
        total_seconds += value * scale;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total_seconds)
        .map_err(|e| ConfigurationError::invalid_duration(input, e.to_string()))
}

/// Inverse of [`parse_duration`] for whole seconds or milliseconds
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Serde adapter reading durations as humane strings or integer seconds
pub(crate) mod duration_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawDuration {
            Seconds(u64),
            Text(String),
        }

        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            RawDuration::Text(text) => super::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}
