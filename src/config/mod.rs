//! Engine configuration loaded from TOML
//!
//! Every section falls back to defaults, so an empty file (or no file at all)
//! yields a working engine.

use crate::error::ConfigError;
use crate::triggers::AlertRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted loop interval (one week)
pub const MAX_INTERVAL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted retention period (one hundred years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub notifications: NotificationConfig,
    pub storage: StorageConfig,
    /// Default warning/critical thresholds used to classify stored metric records
    pub thresholds: BTreeMap<String, MetricThreshold>,
    /// Rules inserted at startup when no rule with the same name exists
    pub rules: Vec<AlertRule>,
}

/// Loop intervals, timeouts and retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub collection_interval_seconds: u64,
    pub evaluation_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub collector_timeout_ms: u64,
    pub metric_retention_days: u32,
    pub alert_retention_days: u32,
}

/// Notification retry policy and channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Target for the `webhook` channel; the channel is not registered without it
    pub webhook_url: Option<String>,
    pub webhook_timeout_seconds: u64,
}

/// Durable storage location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state file for rules, alerts and notifications; metric history
    /// goes to `<stem>.metrics.jsonl` beside it. In-memory storage when absent.
    pub path: Option<PathBuf>,
}

/// Warning and critical levels for one metric name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricThreshold {
    pub warning: f64,
    pub critical: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collection_interval_seconds: 10,
            evaluation_interval_seconds: 30,
            cleanup_interval_seconds: 3600,
            collector_timeout_ms: 5000,
            metric_retention_days: 30,
            alert_retention_days: 90,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            webhook_url: None,
            webhook_timeout_seconds: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
            thresholds: default_thresholds(),
            rules: Vec::new(),
        }
    }
}

fn default_thresholds() -> BTreeMap<String, MetricThreshold> {
    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "cpu_usage".to_string(),
        MetricThreshold {
            warning: 70.0,
            critical: 90.0,
        },
    );
    thresholds.insert(
        "memory_usage".to_string(),
        MetricThreshold {
            warning: 80.0,
            critical: 95.0,
        },
    );
    thresholds.insert(
        "disk_usage".to_string(),
        MetricThreshold {
            warning: 80.0,
            critical: 95.0,
        },
    );
    thresholds
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and seed rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.collection_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "engine.collection_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if engine.evaluation_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "engine.evaluation_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if engine.cleanup_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "engine.cleanup_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if engine.collector_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.collector_timeout_ms must be greater than 0".to_string(),
            ));
        }
        // Upper bounds keep interval and cutoff arithmetic inside the
        // representable time range
        for (field, seconds) in [
            ("collection_interval_seconds", engine.collection_interval_seconds),
            ("evaluation_interval_seconds", engine.evaluation_interval_seconds),
            ("cleanup_interval_seconds", engine.cleanup_interval_seconds),
        ] {
            if seconds > MAX_INTERVAL_SECONDS {
                return Err(ConfigError::ValidationError(format!(
                    "engine.{} must be at most {}",
                    field, MAX_INTERVAL_SECONDS
                )));
            }
        }
        for (field, days) in [
            ("metric_retention_days", engine.metric_retention_days),
            ("alert_retention_days", engine.alert_retention_days),
        ] {
            if days > MAX_RETENTION_DAYS {
                return Err(ConfigError::ValidationError(format!(
                    "engine.{} must be at most {}",
                    field, MAX_RETENTION_DAYS
                )));
            }
        }

        let notifications = &self.notifications;
        if notifications.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "notifications.max_attempts must be at least 1".to_string(),
            ));
        }
        if notifications.max_backoff_ms < notifications.base_backoff_ms {
            return Err(ConfigError::ValidationError(
                "notifications.max_backoff_ms must not be below base_backoff_ms".to_string(),
            ));
        }

        // NaN levels would classify every record as normal
        for (name, threshold) in &self.thresholds {
            if !threshold.warning.is_finite() || !threshold.critical.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "thresholds.{} must be finite numbers",
                    name
                )));
            }
            if threshold.warning > threshold.critical {
                return Err(ConfigError::ValidationError(format!(
                    "thresholds.{}: warning ({}) is above critical ({})",
                    name, threshold.warning, threshold.critical
                )));
            }
        }

        // Seed rules get the same checks as rules created through the API
        for rule in &self.rules {
            rule.validate()
                .map_err(|e| ConfigError::ValidationError(format!("rule '{}': {}", rule.name, e)))?;
        }

        Ok(())
    }
}

impl EngineConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_seconds)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    pub fn metric_retention(&self) -> chrono::Duration {
        retention(self.metric_retention_days)
    }

    pub fn alert_retention(&self) -> chrono::Duration {
        retention(self.alert_retention_days)
    }
}

/// Days as a chrono duration, capped at `MAX_RETENTION_DAYS`
fn retention(days: u32) -> chrono::Duration {
    chrono::Duration::try_days(i64::from(days.min(MAX_RETENTION_DAYS)))
        .unwrap_or_else(chrono::Duration::zero)
}

impl NotificationConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
