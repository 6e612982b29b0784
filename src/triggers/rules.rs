//! Threshold alert rules
//!
//! A rule compares the latest value of one metric against a fixed threshold.
//! Rules are self-contained: evaluating one needs nothing beyond the value.

use crate::error::MonitorError;
use crate::model::{MetricKind, Severity, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Longest accepted suppression window or escalation delay (five years)
pub const MAX_WINDOW_SECONDS: u64 = 5 * 365 * 24 * 60 * 60;

/// Comparison operator applied as `value <op> threshold`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Condition {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte")]
    Ge,
    #[serde(rename = "<=", alias = "lte")]
    Le,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Condition {
    /// Evaluate the comparison
    ///
    /// A NaN on either side never satisfies any operator, `!=` included.
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        if value.is_nan() || threshold.is_nan() {
            return false;
        }
        match self {
            Condition::Gt => value > threshold,
            Condition::Lt => value < threshold,
            Condition::Ge => value >= threshold,
            Condition::Le => value <= threshold,
            Condition::Eq => value == threshold,
            Condition::Ne => value != threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Condition::Gt => ">",
            Condition::Lt => "<",
            Condition::Ge => ">=",
            Condition::Le => "<=",
            Condition::Eq => "==",
            Condition::Ne => "!=",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Condition {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Condition::Gt),
            "<" => Ok(Condition::Lt),
            ">=" => Ok(Condition::Ge),
            "<=" => Ok(Condition::Le),
            "==" => Ok(Condition::Eq),
            "!=" => Ok(Condition::Ne),
            other => Err(MonitorError::Configuration(format!(
                "unknown condition operator '{}'",
                other
            ))),
        }
    }
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_enabled() -> bool {
    true
}

/// A threshold alert rule
///
/// Alerts are keyed by `name`, so names are unique across the rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    /// Assigned when the rule is created; zero for rules not yet stored
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub metric_name: String,
    /// When set, samples of any other kind are ignored
    #[serde(default)]
    pub metric_type: Option<MetricKind>,
    pub condition: Condition,
    pub threshold: f64,
    /// Consecutive true evaluations required before triggering (0 or 1 = immediate)
    #[serde(default)]
    pub duration: u32,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub suppression: bool,
    #[serde(default)]
    pub suppression_window_seconds: u64,
    #[serde(default)]
    pub escalation: bool,
    #[serde(default)]
    pub escalation_delay_seconds: u64,
    #[serde(default)]
    pub max_escalation_level: u32,
    /// Targets in the form `channel` or `channel:recipient`
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created_at: Timestamp,
    #[serde(default = "Utc::now")]
    pub updated_at: Timestamp,
}

impl AlertRule {
    /// Create an enabled rule with no suppression, escalation or channels
    ///
    /// # Arguments
    ///
    /// * `name` - Unique rule name
    /// * `metric_name` - Metric whose latest value is compared
    /// * `condition` - Comparison operator
    /// * `threshold` - Right-hand side of the comparison
    /// * `severity` - Severity of alerts fired by this rule
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        condition: Condition,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            metric_name: metric_name.into(),
            metric_type: None,
            condition,
            threshold,
            duration: 0,
            severity,
            enabled: true,
            suppression: false,
            suppression_window_seconds: 0,
            escalation: false,
            escalation_delay_seconds: 0,
            max_escalation_level: 0,
            notification_channels: Vec::new(),
            created_by: String::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metric_type(mut self, kind: MetricKind) -> Self {
        self.metric_type = Some(kind);
        self
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_suppression(mut self, window_seconds: u64) -> Self {
        self.suppression = true;
        self.suppression_window_seconds = window_seconds;
        self
    }

    pub fn with_escalation(mut self, delay_seconds: u64, max_level: u32) -> Self {
        self.escalation = true;
        self.escalation_delay_seconds = delay_seconds;
        self.max_escalation_level = max_level;
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notification_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the rule's own fields
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` describing the first invalid field.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.name.trim().is_empty() {
            return Err(MonitorError::Configuration(
                "rule name must not be empty".to_string(),
            ));
        }
        if self.metric_name.trim().is_empty() {
            return Err(MonitorError::Configuration(
                "rule metric_name must not be empty".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(MonitorError::Configuration(format!(
                "threshold must be a finite number, got {}",
                self.threshold
            )));
        }
        if self.suppression && self.suppression_window_seconds == 0 {
            return Err(MonitorError::Configuration(
                "suppression requires a non-zero suppression_window_seconds".to_string(),
            ));
        }
        if self.escalation && self.escalation_delay_seconds == 0 {
            return Err(MonitorError::Configuration(
                "escalation requires a non-zero escalation_delay_seconds".to_string(),
            ));
        }
        // Bounded whether or not the feature is switched on
        for (field, seconds) in [
            ("suppression_window_seconds", self.suppression_window_seconds),
            ("escalation_delay_seconds", self.escalation_delay_seconds),
        ] {
            if seconds > MAX_WINDOW_SECONDS {
                return Err(MonitorError::Configuration(format!(
                    "{} must be at most {}, got {}",
                    field, MAX_WINDOW_SECONDS, seconds
                )));
            }
        }
        // `channel` or `channel:recipient`; the channel part is required
        for target in &self.notification_channels {
            if target.split(':').next().map_or(true, |c| c.trim().is_empty()) {
                return Err(MonitorError::Configuration(format!(
                    "invalid notification channel target '{}'",
                    target
                )));
            }
        }
        Ok(())
    }

    /// Whether `value` satisfies the rule's condition
    pub fn matches(&self, value: f64) -> bool {
        self.condition.evaluate(value, self.threshold)
    }

    /// Consecutive true evaluations needed before the rule fires
    pub fn required_consecutive(&self) -> u32 {
        self.duration.max(1)
    }

    pub fn suppression_window(&self) -> chrono::Duration {
        window(self.suppression_window_seconds)
    }

    pub fn escalation_delay(&self) -> chrono::Duration {
        window(self.escalation_delay_seconds)
    }

    /// Human-readable alert message for a value that matched
    pub fn describe(&self, value: f64) -> String {
        format!(
            "{}: {} = {:.2} {} {:.2}",
            self.name, self.metric_name, value, self.condition, self.threshold
        )
    }
}

/// Seconds as a chrono duration, capped at `MAX_WINDOW_SECONDS`
///
/// Rules built in code can skip `validate`, so the cap applies here too.
fn window(seconds: u64) -> chrono::Duration {
    let capped = seconds.min(MAX_WINDOW_SECONDS) as i64;
    chrono::Duration::try_seconds(capped).unwrap_or_else(chrono::Duration::zero)
}

/// Immutable snapshot of the rule set, replaced wholesale on reload
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<AlertRule>,
}

impl RuleSet {
    /// Build a snapshot, ordered by rule id
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` if two rules share a name.
    pub fn new(mut rules: Vec<AlertRule>) -> Result<Self, MonitorError> {
        // Alert state is keyed by name
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.as_str()) {
                return Err(MonitorError::Configuration(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }
        rules.sort_by_key(|r| r.id);
        Ok(Self { rules })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&AlertRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn all(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
