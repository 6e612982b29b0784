use crate::error::StoreError;
use crate::model::{Alert, MetricKind, MetricRecord, NotificationRecord, Timestamp};
use crate::triggers::AlertRule;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Highest ids in use per table, used to seed id sequences at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxIds {
    pub rule: u64,
    pub alert: u64,
    pub notification: u64,
}

/// Durable storage for metric history, rules, alerts and notification records
///
/// `create_*` inserts a row whose id the caller already assigned; `save_*`
/// overwrites (or inserts) the row with the same id.
#[cfg_attr(test, mockall::automock)]
pub trait Repository: Send + Sync {
    fn append_metric(&self, record: &MetricRecord) -> Result<(), StoreError>;

    /// Records of `kind` (all kinds when `None`) with `start <= timestamp <= end`,
    /// ordered by timestamp ascending
    fn query_metrics(
        &self,
        kind: Option<MetricKind>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetricRecord>, StoreError>;

    /// Delete records older than `cutoff`, returning how many were removed
    fn delete_metrics_before(&self, cutoff: Timestamp) -> Result<usize, StoreError>;

    fn create_rule(&self, rule: &AlertRule) -> Result<(), StoreError>;
    fn save_rule(&self, rule: &AlertRule) -> Result<(), StoreError>;
    fn find_rule(&self, id: u64) -> Result<Option<AlertRule>, StoreError>;
    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError>;
    /// Returns `false` if no rule had that id
    fn delete_rule(&self, id: u64) -> Result<bool, StoreError>;

    fn create_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    fn find_alert(&self, id: u64) -> Result<Option<Alert>, StoreError>;
    /// Alerts fired within `[start, end]`, ordered by `fired_at`
    fn alerts_fired_between(&self, start: Timestamp, end: Timestamp)
        -> Result<Vec<Alert>, StoreError>;
    /// Active and acknowledged alerts
    fn open_alerts(&self) -> Result<Vec<Alert>, StoreError>;
    /// Delete resolved alerts whose `resolved_at` is older than `cutoff`
    fn delete_resolved_alerts_before(&self, cutoff: Timestamp) -> Result<usize, StoreError>;

    fn create_notification(&self, record: &NotificationRecord) -> Result<(), StoreError>;
    fn save_notification(&self, record: &NotificationRecord) -> Result<(), StoreError>;
    fn notifications_for_alert(&self, alert_id: u64)
        -> Result<Vec<NotificationRecord>, StoreError>;

    fn max_ids(&self) -> Result<MaxIds, StoreError>;

    /// Make buffered changes durable
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Monotonic id allocator
#[derive(Debug)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    /// A sequence whose first id is `max + 1`
    pub fn starting_after(max: u64) -> Self {
        Self(AtomicU64::new(max))
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::starting_after(0)
    }
}

/// In-memory tables shared by both repository implementations
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    pub metrics: Vec<MetricRecord>,
    pub rules: BTreeMap<u64, AlertRule>,
    pub alerts: BTreeMap<u64, Alert>,
    pub notifications: BTreeMap<u64, NotificationRecord>,
}

impl Tables {
    fn query_metrics(
        &self,
        kind: Option<MetricKind>,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .metrics
            .iter()
            .filter(|r| kind.map_or(true, |k| r.sample.kind == k))
            .filter(|r| r.sample.timestamp >= start && r.sample.timestamp <= end)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sample.timestamp);
        records
    }

    fn delete_metrics_before(&mut self, cutoff: Timestamp) -> usize {
        let before = self.metrics.len();
        self.metrics.retain(|r| r.sample.timestamp >= cutoff);
        before - self.metrics.len()
    }

    fn alerts_fired_between(&self, start: Timestamp, end: Timestamp) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .values()
            .filter(|a| a.fired_at >= start && a.fired_at <= end)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| (a.fired_at, a.id));
        alerts
    }

    fn delete_resolved_alerts_before(&mut self, cutoff: Timestamp) -> usize {
        let before = self.alerts.len();
        self.alerts.retain(|_, a| match (a.status.is_open(), a.resolved_at) {
            (false, Some(resolved_at)) => resolved_at >= cutoff,
            _ => true,
        });
        before - self.alerts.len()
    }

    fn max_ids(&self) -> MaxIds {
        MaxIds {
            rule: self.rules.keys().next_back().copied().unwrap_or(0),
            alert: self.alerts.keys().next_back().copied().unwrap_or(0),
            notification: self.notifications.keys().next_back().copied().unwrap_or(0),
        }
    }
}

/// Repository keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of stored metric records
    pub fn metric_count(&self) -> usize {
        self.tables().metrics.len()
    }
}

impl Repository for MemoryRepository {
    fn append_metric(&self, record: &MetricRecord) -> Result<(), StoreError> {
        self.tables().metrics.push(record.clone());
        Ok(())
    }

    fn query_metrics(
        &self,
        kind: Option<MetricKind>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        Ok(self.tables().query_metrics(kind, start, end))
    }

    fn delete_metrics_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        Ok(self.tables().delete_metrics_before(cutoff))
    }

    fn create_rule(&self, rule: &AlertRule) -> Result<(), StoreError> {
        self.tables().rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn save_rule(&self, rule: &AlertRule) -> Result<(), StoreError> {
        self.tables().rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn find_rule(&self, id: u64) -> Result<Option<AlertRule>, StoreError> {
        Ok(self.tables().rules.get(&id).cloned())
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        Ok(self.tables().rules.values().cloned().collect())
    }

    fn delete_rule(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.tables().rules.remove(&id).is_some())
    }

    fn create_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.tables().alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.tables().alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    fn find_alert(&self, id: u64) -> Result<Option<Alert>, StoreError> {
        Ok(self.tables().alerts.get(&id).cloned())
    }

    fn alerts_fired_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Alert>, StoreError> {
        Ok(self.tables().alerts_fired_between(start, end))
    }

    fn open_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .tables()
            .alerts
            .values()
            .filter(|a| a.status.is_open())
            .cloned()
            .collect())
    }

    fn delete_resolved_alerts_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        Ok(self.tables().delete_resolved_alerts_before(cutoff))
    }

    fn create_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.tables().notifications.insert(record.id, record.clone());
        Ok(())
    }

    fn save_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.tables().notifications.insert(record.id, record.clone());
        Ok(())
    }

    fn notifications_for_alert(
        &self,
        alert_id: u64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(self
            .tables()
            .notifications
            .values()
            .filter(|n| n.alert_id == alert_id)
            .cloned()
            .collect())
    }

    fn max_ids(&self) -> Result<MaxIds, StoreError> {
        Ok(self.tables().max_ids())
    }
}
