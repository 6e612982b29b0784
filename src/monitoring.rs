//! Engine self-monitoring counters
//!
//! Counters live for the lifetime of the process and are never reset.
//! Loop failures end up here (and in the log) instead of propagating.

use crate::model::Timestamp;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringStatsSnapshot {
    pub total_collections: u64,
    pub successful_collections: u64,
    pub failed_collections: u64,
    pub active_alert_count: u64,
    pub total_alert_count: u64,
    /// Samples written per collector since start
    pub metric_count_by_collector: BTreeMap<String, u64>,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub evaluation_ticks: u64,
    pub started_at: Timestamp,
}

impl MonitoringStatsSnapshot {
    /// Percentage of finished notifications that were delivered (100 when none finished)
    pub fn notification_success_rate(&self) -> f64 {
        let finished = self.notifications_sent + self.notifications_failed;
        if finished == 0 {
            return 100.0;
        }
        self.notifications_sent as f64 / finished as f64 * 100.0
    }
}

/// Shared engine counters
#[derive(Debug)]
pub struct MonitoringStats {
    total_collections: AtomicU64,
    successful_collections: AtomicU64,
    failed_collections: AtomicU64,
    active_alerts: AtomicU64,
    total_alerts: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    evaluation_ticks: AtomicU64,
    metrics_by_collector: Mutex<BTreeMap<String, u64>>,
    started_at: Timestamp,
}

impl Default for MonitoringStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringStats {
    pub fn new() -> Self {
        Self {
            total_collections: AtomicU64::new(0),
            successful_collections: AtomicU64::new(0),
            failed_collections: AtomicU64::new(0),
            active_alerts: AtomicU64::new(0),
            total_alerts: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            evaluation_ticks: AtomicU64::new(0),
            metrics_by_collector: Mutex::new(BTreeMap::new()),
            started_at: Utc::now(),
        }
    }

    /// Record a collector run that produced `samples` samples
    pub fn record_collection_success(&self, collector: &str, samples: usize) {
        self.total_collections.fetch_add(1, Ordering::Relaxed);
        self.successful_collections.fetch_add(1, Ordering::Relaxed);

        let mut counts = self
            .metrics_by_collector
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *counts.entry(collector.to_string()).or_insert(0) += samples as u64;
    }

    pub fn record_collection_failure(&self) {
        self.total_collections.fetch_add(1, Ordering::Relaxed);
        self.failed_collections.fetch_add(1, Ordering::Relaxed);
    }

    /// A new alert entered the active table
    pub fn alert_opened(&self) {
        self.total_alerts.fetch_add(1, Ordering::SeqCst);
        self.active_alerts.fetch_add(1, Ordering::SeqCst);
    }

    /// An alert restored from storage re-entered the active table
    pub fn alert_restored(&self) {
        self.active_alerts.fetch_add(1, Ordering::SeqCst);
    }

    /// An alert left the active table
    pub fn alert_closed(&self) {
        let result = self
            .active_alerts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            warn!("Active alert count would drop below zero; ignoring");
        }
    }

    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evaluation_tick(&self) {
        self.evaluation_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_alert_count(&self) -> u64 {
        self.active_alerts.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MonitoringStatsSnapshot {
        let metric_count_by_collector = self
            .metrics_by_collector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        MonitoringStatsSnapshot {
            total_collections: self.total_collections.load(Ordering::Relaxed),
            successful_collections: self.successful_collections.load(Ordering::Relaxed),
            failed_collections: self.failed_collections.load(Ordering::Relaxed),
            active_alert_count: self.active_alerts.load(Ordering::SeqCst),
            total_alert_count: self.total_alerts.load(Ordering::SeqCst),
            metric_count_by_collector,
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            evaluation_ticks: self.evaluation_ticks.load(Ordering::Relaxed),
            started_at: self.started_at,
        }
    }

    /// Write a one-line summary to the log, warning on poor delivery rates
    pub fn log_summary(&self) {
        let s = self.snapshot();
        let success_rate = s.notification_success_rate();
        info!(
            "Engine stats: collections={}/{} ok, active_alerts={}, total_alerts={}, notifications sent={} failed={} ({:.1}%), evaluation_ticks={}",
            s.successful_collections,
            s.total_collections,
            s.active_alert_count,
            s.total_alert_count,
            s.notifications_sent,
            s.notifications_failed,
            success_rate,
            s.evaluation_ticks
        );

        if success_rate < 90.0 {
            warn!("Low notification success rate: {:.1}%", success_rate);
        }
    }
}
