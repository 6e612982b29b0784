//! Core data types shared across the engine
//!
//! Samples produced by collectors, the records they become once persisted,
//! alerts and the notification records created for them.

use crate::error::MonitorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Free-form key/value labels attached to a sample
pub type Labels = BTreeMap<String, String>;

/// Kind of metric, used to group samples for current-value and history queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Host resources: CPU, memory, disk, network
    System,
    /// The running process: threads, memory, request latency
    Application,
    /// Product-level counters such as active users
    Business,
    /// Anything recorded through the custom metric API
    Custom,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::System,
        MetricKind::Application,
        MetricKind::Business,
        MetricKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::System => "system",
            MetricKind::Application => "application",
            MetricKind::Business => "business",
            MetricKind::Custom => "custom",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(MetricKind::System),
            "application" => Ok(MetricKind::Application),
            "business" => Ok(MetricKind::Business),
            "custom" => Ok(MetricKind::Custom),
            other => Err(MonitorError::Configuration(format!(
                "unknown metric type '{}'",
                other
            ))),
        }
    }
}

/// A single measurement produced by a collector
///
/// Immutable once produced: written once to the metric store and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub name: String,
    #[serde(with = "float_repr")]
    pub value: f64,
    pub unit: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub labels: Labels,
}

impl MetricSample {
    /// Create a sample stamped with the current time
    pub fn new(kind: MetricKind, name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            labels: Labels::new(),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Health classification of a persisted metric value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Normal,
    Warning,
    Critical,
}

/// Severity level for alert rules, alerts and metric records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action required
    Info,
    /// Warning that may require attention
    Warning,
    /// Critical issue requiring immediate attention
    Critical,
}

impl Severity {
    /// The next severity up, saturating at critical
    pub fn escalate(self) -> Self {
        match self {
            Severity::Info => Severity::Warning,
            Severity::Warning | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl From<MetricStatus> for Severity {
    fn from(status: MetricStatus) -> Self {
        match status {
            MetricStatus::Normal => Severity::Info,
            MetricStatus::Warning => Severity::Warning,
            MetricStatus::Critical => Severity::Critical,
        }
    }
}

/// A sample as stored in durable storage
///
/// Append-only; removed only by retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    #[serde(flatten)]
    pub sample: MetricSample,
    pub status: MetricStatus,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub tags: Labels,
}

/// Lifecycle state of an alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Active and acknowledged alerts are both still firing
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

/// The stateful record of one firing episode of a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    /// Allocated by the engine on creation
    pub id: u64,
    pub rule_id: u64,
    pub rule_name: String,
    pub metric_name: String,
    #[serde(with = "float_repr")]
    pub value: f64,
    #[serde(with = "float_repr")]
    pub threshold: f64,
    pub condition: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub fired_at: Timestamp,
    pub updated_at: Timestamp,
    pub acknowledged_at: Option<Timestamp>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub escalation_level: u32,
    #[serde(default)]
    pub last_escalated_at: Option<Timestamp>,
    /// Recorded inside a suppression window, so no notification was sent
    #[serde(default)]
    pub suppressed: bool,
}

/// Delivery state of a notification record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Retrying,
}

/// History of one notification delivered (or attempted) to one channel target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    /// Allocated by the engine on creation
    pub id: u64,
    pub alert_id: u64,
    pub channel: String,
    pub recipient: String,
    pub status: NotificationStatus,
    pub content: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Serde adapter for `f64` fields that may hold NaN or an infinity
///
/// JSON has no literal for them, so they are written as the strings `"NaN"`,
/// `"inf"` and `"-inf"`. Finite values stay plain numbers.
pub mod float_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            // f64's parser accepts NaN, inf and infinity in any case
            Repr::Text(text) => text
                .parse::<f64>()
                .map_err(|_| D::Error::custom(format!("invalid float '{}'", text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&MetricKind::System).unwrap(),
            "\"system\""
        );
        assert_eq!(
            serde_json::to_string(&MetricKind::Business).unwrap(),
            "\"business\""
        );
    }

    #[test]
    fn test_metric_kind_from_str() {
        assert_eq!("business".parse::<MetricKind>().unwrap(), MetricKind::Business);
        assert_eq!(" System ".parse::<MetricKind>().unwrap(), MetricKind::System);
        assert!(matches!(
            "gpu".parse::<MetricKind>(),
            Err(MonitorError::Configuration(_))
        ));
    }

    #[test]
    fn test_severity_ordering_and_escalation() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(Severity::Info.escalate(), Severity::Warning);
        assert_eq!(Severity::Warning.escalate(), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn test_metric_record_flattens_sample() {
        let record = MetricRecord {
            sample: MetricSample::new(MetricKind::System, "cpu_usage", 42.0, "%"),
            status: MetricStatus::Normal,
            severity: Severity::Info,
            description: "cpu_usage 42.00%".to_string(),
            tags: Labels::new(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["name"], "cpu_usage");
        assert_eq!(value["kind"], "system");
        assert_eq!(value["status"], "normal");

        let back: MetricRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let nan = MetricSample::new(MetricKind::Custom, "ratio", f64::NAN, "");
        let json = serde_json::to_string(&nan).unwrap();
        assert!(json.contains("\"value\":\"NaN\""));
        let back: MetricSample = serde_json::from_str(&json).unwrap();
        assert!(back.value.is_nan());

        for value in [f64::INFINITY, f64::NEG_INFINITY, -0.5, 1e300] {
            let record = MetricRecord {
                sample: MetricSample::new(MetricKind::System, "load", value, ""),
                status: MetricStatus::Normal,
                severity: Severity::Info,
                description: String::new(),
                tags: Labels::new(),
            };
            let json = serde_json::to_string(&record).unwrap();
            let back: MetricRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(back.sample.value, value);
        }

        assert!(serde_json::from_str::<MetricSample>(
            r#"{"kind":"system","name":"x","value":"lots","unit":"","timestamp":"2026-01-01T00:00:00Z"}"#
        )
        .is_err());
    }

    #[test]
    fn test_alert_status_is_open() {
        assert!(AlertStatus::Active.is_open());
        assert!(AlertStatus::Acknowledged.is_open());
        assert!(!AlertStatus::Resolved.is_open());
    }
}
