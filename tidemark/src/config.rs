//! Database configuration.
//!
//! A [`DatabaseConfig`] names the backing file and controls retention, the
//! sweep cadence and the persistence options. Configs can be built in code or
//! loaded from a JSON document, where durations are written as seconds:
//!
//! ```json
//! {
//!   "path": "/var/lib/app/metrics.tdm",
//!   "retention": 604800,
//!   "cleanup_interval": 900,
//!   "memory_mapping": true
//! }
//! ```
//!
//! Omitted fields take their defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::storage::StorageOptions;

/// Default retention period: 30 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default interval between retention sweeps: 1 hour.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default lock-striping hint for the storage engine.
pub const DEFAULT_CONCURRENCY_SCALE: usize = 16;

pub(crate) const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the backing file. Created if it does not exist.
    pub path: PathBuf,

    /// Data older than `now - retention` is removed by the sweeper.
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,

    /// Time between the end of one sweep and the start of the next.
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// Number of lock stripes used by the storage engine's map directory.
    #[serde(default = "default_concurrency_scale")]
    pub concurrency_scale: usize,

    /// Read the backing file through a memory map on open.
    #[serde(default = "default_true")]
    pub memory_mapping: bool,

    /// Commit through a temporary file and an atomic rename.
    #[serde(default = "default_true")]
    pub transactions: bool,
}

fn default_retention() -> Duration {
    DEFAULT_RETENTION
}

fn default_cleanup_interval() -> Duration {
    DEFAULT_CLEANUP_INTERVAL
}

fn default_concurrency_scale() -> usize {
    DEFAULT_CONCURRENCY_SCALE
}

fn default_true() -> bool {
    true
}

impl DatabaseConfig {
    /// Creates a config for `path` with every other field at its default.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retention: DEFAULT_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            concurrency_scale: DEFAULT_CONCURRENCY_SCALE,
            memory_mapping: true,
            transactions: true,
        }
    }

    /// Sets the retention period in whole days.
    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention = Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY));
        self
    }

    /// Sets the retention period.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the interval between retention sweeps.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Parses a config from a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and any
    /// [`validate`](Self::validate) error.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise the
    /// same errors as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - the path is empty or blank
    /// - the retention period or cleanup interval is zero
    /// - the concurrency scale is zero
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(ConfigError::EmptyPath.into());
        }
        if self.retention.is_zero() {
            return Err(ConfigError::InvalidRetention {
                retention: self.retention,
            }
            .into());
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidCleanupInterval {
                interval: self.cleanup_interval,
            }
            .into());
        }
        if self.concurrency_scale == 0 {
            return Err(ConfigError::InvalidConcurrencyScale {
                scale: self.concurrency_scale,
            }
            .into());
        }
        Ok(())
    }

    /// Retention period in milliseconds, saturating at `i64::MAX`.
    pub fn retention_millis(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }

    pub(crate) fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            memory_mapping: self.memory_mapping,
            transactions: self.transactions,
            concurrency_scale: self.concurrency_scale,
        }
    }
}

/// Serializes a [`Duration`] as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidemarkError;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::new("/tmp/metrics.tdm");
        assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3_600));
        assert_eq!(config.concurrency_scale, 16);
        assert!(config.memory_mapping);
        assert!(config.transactions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_days() {
        let config = DatabaseConfig::new("db").with_retention_days(7);
        assert_eq!(config.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(config.retention_millis(), 7 * 86_400_000);
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = DatabaseConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, TidemarkError::Config(ConfigError::EmptyPath)));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let err = DatabaseConfig::new("db")
            .with_retention_days(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Config(ConfigError::InvalidRetention { .. })
        ));

        let err = DatabaseConfig::new("db")
            .with_cleanup_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Config(ConfigError::InvalidCleanupInterval { .. })
        ));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            DatabaseConfig::from_json_str(r#"{"path": "a.tdm", "retention": 86400}"#).unwrap();
        assert_eq!(config.path, PathBuf::from("a.tdm"));
        assert_eq!(config.retention, Duration::from_secs(86_400));
        assert_eq!(config.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
        assert!(config.transactions);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        let err = DatabaseConfig::from_json_str(r#"{"path": "a", "retention": -1}"#).unwrap_err();
        assert!(matches!(err, TidemarkError::Config(ConfigError::Parse(_))));

        let err =
            DatabaseConfig::from_json_str(r#"{"path": "a", "concurrency_scale": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Config(ConfigError::InvalidConcurrencyScale { scale: 0 })
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tidemark.json");
        std::fs::write(&file, r#"{"path": "db.tdm", "cleanup_interval": 1.5}"#).unwrap();

        let config = DatabaseConfig::from_json_file(&file).unwrap();
        assert_eq!(config.cleanup_interval, Duration::from_millis(1_500));

        let err = DatabaseConfig::from_json_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, TidemarkError::Config(ConfigError::Read { .. })));
    }
}
