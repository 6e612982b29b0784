//! On-demand aggregation over stored metric and alert history

use crate::error::MonitorError;
use crate::model::{Alert, AlertStatus, MetricKind, MetricRecord, Severity, Timestamp};
use crate::store::Repository;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Count, average and extremes of one metric name over the report window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricStatistics {
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn finish(self) -> MetricStatistics {
        MetricStatistics {
            count: self.count,
            average: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportStatistics {
    /// Keyed by metric name
    pub metrics: BTreeMap<String, MetricStatistics>,
    pub alerts_by_status: BTreeMap<AlertStatus, usize>,
    pub alerts_by_severity: BTreeMap<Severity, usize>,
    pub total_metrics: usize,
    pub total_alerts: usize,
}

/// Metrics and alerts for a time window plus their statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub start: Timestamp,
    pub end: Timestamp,
    pub generated_at: Timestamp,
    /// Records in the window grouped by kind, oldest first
    pub metrics: BTreeMap<MetricKind, Vec<MetricRecord>>,
    /// Alerts fired in the window, oldest first
    pub alerts: Vec<Alert>,
    pub statistics: ReportStatistics,
}

/// Builds reports from the repository
pub struct ReportGenerator {
    repository: Arc<dyn Repository>,
}

impl ReportGenerator {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Load the window from storage and build a report
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` if `start` is after `end`,
    /// `MonitorError::Persistence` if storage cannot be read.
    pub fn generate(&self, start: Timestamp, end: Timestamp) -> Result<Report, MonitorError> {
        if start > end {
            return Err(MonitorError::Configuration(format!(
                "report start {} is after end {}",
                start, end
            )));
        }

        let metrics = self.repository.query_metrics(None, start, end)?;
        let alerts = self.repository.alerts_fired_between(start, end)?;
        debug!(
            "Building report over {} metric records and {} alerts",
            metrics.len(),
            alerts.len()
        );
        Ok(Self::build(start, end, metrics, alerts))
    }

    /// Aggregate already-loaded records, one pass over each sequence
    pub fn build(
        start: Timestamp,
        end: Timestamp,
        metrics: Vec<MetricRecord>,
        alerts: Vec<Alert>,
    ) -> Report {
        let mut statistics = ReportStatistics {
            total_metrics: metrics.len(),
            total_alerts: alerts.len(),
            ..ReportStatistics::default()
        };

        let mut accumulators: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut grouped: BTreeMap<MetricKind, Vec<MetricRecord>> = BTreeMap::new();
        for record in metrics {
            let value = record.sample.value;
            accumulators
                .entry(record.sample.name.clone())
                .and_modify(|acc| acc.add(value))
                .or_insert_with(|| Accumulator::new(value));
            grouped.entry(record.sample.kind).or_default().push(record);
        }
        statistics.metrics = accumulators
            .into_iter()
            .map(|(name, acc)| (name, acc.finish()))
            .collect();

        for alert in &alerts {
            *statistics.alerts_by_status.entry(alert.status).or_default() += 1;
            *statistics.alerts_by_severity.entry(alert.severity).or_default() += 1;
        }

        Report {
            start,
            end,
            generated_at: Utc::now(),
            metrics: grouped,
            alerts,
            statistics,
        }
    }
}
