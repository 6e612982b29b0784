//! File-backed repository
//!
//! Rules, alerts and notification records live in a JSON snapshot at the
//! configured path. Metric history lives beside it in an append-only JSON
//! lines file (`<stem>.metrics.jsonl`), so recording a sample never rewrites
//! the snapshot. Rule changes are written through at once; everything else
//! becomes durable on the next `flush`.

use crate::error::StoreError;
use crate::model::{Alert, MetricKind, MetricRecord, NotificationRecord, Timestamp};
use crate::store::repository::{MaxIds, MemoryRepository, Repository, Tables};
use crate::triggers::AlertRule;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Everything except metric history
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    rules: BTreeMap<u64, AlertRule>,
    alerts: BTreeMap<u64, Alert>,
    notifications: BTreeMap<u64, NotificationRecord>,
}

#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    metrics_path: PathBuf,
    inner: MemoryRepository,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
    /// Lazily opened append handle; taken before the tables lock
    metric_log: Mutex<Option<BufWriter<File>>>,
}

impl JsonFileRepository {
    /// Open the snapshot at `path` and its metric log, starting empty if
    /// either file does not exist
    ///
    /// # Errors
    ///
    /// `StoreError::Io` if a file exists but cannot be read, and
    /// `StoreError::Serialization` if the snapshot is not valid JSON.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let metrics_path = path.with_extension("metrics.jsonl");

        let snapshot: Snapshot = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            Snapshot::default()
        };
        let metrics = read_metric_log(&metrics_path)?;

        info!(
            "Opened JSON repository at {} ({} metric records, {} rules, {} alerts)",
            path.display(),
            metrics.len(),
            snapshot.rules.len(),
            snapshot.alerts.len()
        );

        let tables = Tables {
            metrics,
            rules: snapshot.rules,
            alerts: snapshot.alerts,
            notifications: snapshot.notifications,
        };
        Ok(Self {
            path,
            metrics_path,
            inner: MemoryRepository::from_tables(tables),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            metric_log: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics_path(&self) -> &Path {
        &self.metrics_path
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Write the snapshot to a sibling temp file, then rename over the target
    fn write_snapshot(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.dirty.store(false, Ordering::SeqCst);

        // Copy out under the tables lock, serialize after releasing it
        let snapshot = {
            let tables = self.inner.tables();
            Snapshot {
                rules: tables.rules.clone(),
                alerts: tables.alerts.clone(),
                notifications: tables.notifications.clone(),
            }
        };
        let json = serde_json::to_vec(&snapshot)?;

        let result = replace_file(&self.path, "json.tmp", &json);
        if result.is_err() {
            // Retry on the next flush
            self.mark_dirty();
        } else {
            debug!("Wrote repository snapshot ({} bytes)", json.len());
        }
        result
    }

    fn lock_metric_log(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.metric_log.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write_through<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&MemoryRepository) -> Result<(), StoreError>,
    {
        change(&self.inner)?;
        self.mark_dirty();
        self.write_snapshot()
    }

    fn deferred<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&MemoryRepository) -> Result<T, StoreError>,
    {
        let result = change(&self.inner)?;
        self.mark_dirty();
        Ok(result)
    }
}

/// Load every record from a metric log, skipping lines that do not parse
///
/// A crash mid-append can leave a torn last line behind.
fn read_metric_log(path: &Path) -> Result<Vec<MetricRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MetricRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                debug!("Skipping metric log line: {}", e);
            }
        }
    }
    if skipped > 0 {
        warn!(
            "Skipped {} unreadable lines in metric log {}",
            skipped,
            path.display()
        );
    }
    Ok(records)
}

/// Atomically replace `path` with `contents` through a temp file
fn replace_file(path: &Path, tmp_extension: &str, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension(tmp_extension);
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn open_for_append(path: &Path) -> Result<BufWriter<File>, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl Repository for JsonFileRepository {
    fn append_metric(&self, record: &MetricRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut log = self.lock_metric_log();
        if log.is_none() {
            *log = Some(open_for_append(&self.metrics_path)?);
        }
        if let Some(writer) = log.as_mut() {
            writer.write_all(&line)?;
        }
        self.inner.append_metric(record)
    }

    fn query_metrics(
        &self,
        kind: Option<MetricKind>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        self.inner.query_metrics(kind, start, end)
    }

    /// Rewrites the metric log with the surviving records
    fn delete_metrics_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        let mut log = self.lock_metric_log();
        let removed = self.inner.delete_metrics_before(cutoff)?;
        if removed == 0 {
            return Ok(0);
        }

        let mut contents = Vec::new();
        for record in &self.inner.tables().metrics {
            serde_json::to_writer(&mut contents, record)?;
            contents.push(b'\n');
        }
        // Drop the old handle first so nothing appends to the replaced file
        *log = None;
        replace_file(&self.metrics_path, "jsonl.tmp", &contents)?;
        Ok(removed)
    }

    fn create_rule(&self, rule: &AlertRule) -> Result<(), StoreError> {
        self.write_through(|r| r.create_rule(rule))
    }

    fn save_rule(&self, rule: &AlertRule) -> Result<(), StoreError> {
        self.write_through(|r| r.save_rule(rule))
    }

    fn find_rule(&self, id: u64) -> Result<Option<AlertRule>, StoreError> {
        self.inner.find_rule(id)
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        self.inner.list_rules()
    }

    fn delete_rule(&self, id: u64) -> Result<bool, StoreError> {
        let removed = self.inner.delete_rule(id)?;
        if removed {
            self.mark_dirty();
            self.write_snapshot()?;
        }
        Ok(removed)
    }

    fn create_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.deferred(|r| r.create_alert(alert))
    }

    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.deferred(|r| r.save_alert(alert))
    }

    fn find_alert(&self, id: u64) -> Result<Option<Alert>, StoreError> {
        self.inner.find_alert(id)
    }

    fn alerts_fired_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Alert>, StoreError> {
        self.inner.alerts_fired_between(start, end)
    }

    fn open_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        self.inner.open_alerts()
    }

    fn delete_resolved_alerts_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        self.deferred(|r| r.delete_resolved_alerts_before(cutoff))
    }

    fn create_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.deferred(|r| r.create_notification(record))
    }

    fn save_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.deferred(|r| r.save_notification(record))
    }

    fn notifications_for_alert(
        &self,
        alert_id: u64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.inner.notifications_for_alert(alert_id)
    }

    fn max_ids(&self) -> Result<MaxIds, StoreError> {
        self.inner.max_ids()
    }

    fn flush(&self) -> Result<(), StoreError> {
        {
            let mut log = self.lock_metric_log();
            if let Some(writer) = log.as_mut() {
                writer.flush()?;
                writer.get_ref().sync_data()?;
            }
        }

        // The snapshot is only rewritten when something other than metrics changed
        if self.dirty.load(Ordering::SeqCst) {
            self.write_snapshot()
        } else {
            Ok(())
        }
    }
}
