use crate::collectors::{CollectFuture, Collector};
use crate::error::MonitorError;
use crate::model::{Labels, MetricKind, MetricSample};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Registry of caller-recorded gauges, re-emitted on every collection tick
///
/// Each gauge keeps the kind and labels it was recorded with, so a custom
/// metric can land under any [`MetricKind`].
#[derive(Debug, Default)]
pub struct CustomCollector {
    gauges: Mutex<BTreeMap<String, MetricSample>>,
}

impl CustomCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a gauge
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` for an empty or whitespace-containing name
    /// or a non-finite value.
    pub fn record(
        &self,
        kind: MetricKind,
        name: &str,
        value: f64,
        labels: Labels,
    ) -> Result<MetricSample, MonitorError> {
        let name = name.trim();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(MonitorError::Configuration(format!(
                "invalid metric name '{}'",
                name
            )));
        }
        if !value.is_finite() {
            return Err(MonitorError::Configuration(format!(
                "metric '{}' value must be finite, got {}",
                name, value
            )));
        }

        let sample = MetricSample::new(kind, name, value, "").with_labels(labels);
        self.lock().insert(name.to_string(), sample.clone());
        Ok(sample)
    }

    /// Stop re-emitting a gauge
    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MetricSample>> {
        self.gauges.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Collector for CustomCollector {
    fn name(&self) -> &str {
        "custom"
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Custom
    }

    fn collect(&self) -> CollectFuture<'_> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(self
                .lock()
                .values()
                .map(|sample| sample.clone().at(now))
                .collect())
        })
    }
}
