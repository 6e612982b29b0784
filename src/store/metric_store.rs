use crate::config::MetricThreshold;
use crate::error::StoreError;
use crate::model::{MetricKind, MetricRecord, MetricSample, MetricStatus, Severity, Timestamp};
use crate::store::repository::Repository;
use dashmap::DashMap;
use log::{debug, error, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long `flush` waits for the background writer to drain
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum WriterMessage {
    Append(Box<MetricRecord>),
    Flush(Sender<()>),
    Shutdown,
}

/// Latest-value cache plus a background write path to durable storage
///
/// `write` never blocks on storage: records are queued to a dedicated writer
/// thread. Append failures are logged and do not affect the cache. Writers
/// share the queue through a read lock; only shutdown takes it exclusively.
pub struct MetricStore {
    latest: DashMap<String, MetricSample>,
    thresholds: BTreeMap<String, MetricThreshold>,
    repository: Arc<dyn Repository>,
    sender: RwLock<Option<Sender<WriterMessage>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MetricStore {
    /// Create a store and start its writer thread
    ///
    /// # Arguments
    ///
    /// * `repository` - Durable storage receiving every written sample
    /// * `thresholds` - Per-metric warning/critical levels used to classify records
    pub fn new(
        repository: Arc<dyn Repository>,
        thresholds: BTreeMap<String, MetricThreshold>,
    ) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel();
        let writer_repo = Arc::clone(&repository);
        let thread = thread::Builder::new()
            .name("metric-writer".to_string())
            .spawn(move || run_writer(writer_repo, receiver))?;

        Ok(Self {
            latest: DashMap::new(),
            thresholds,
            repository,
            sender: RwLock::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Update the cache and queue the durable append
    pub fn write(&self, sample: MetricSample) {
        let record = self.classify(&sample);
        self.latest.insert(sample.name.clone(), sample);

        let message = WriterMessage::Append(Box::new(record));
        let unsent = match self.read_sender().as_ref() {
            Some(sender) => sender.send(message).err().map(|e| e.0),
            None => Some(message),
        };

        // Writer gone (after shutdown): append inline
        if let Some(WriterMessage::Append(record)) = unsent {
            if let Err(e) = self.repository.append_metric(&record) {
                error!("Failed to persist metric '{}': {}", record.sample.name, e);
            }
        }
    }

    /// Most recent sample written under `name`
    pub fn latest(&self, name: &str) -> Option<MetricSample> {
        self.latest.get(name).map(|entry| entry.value().clone())
    }

    /// Newest sample per metric kind
    pub fn current(&self) -> HashMap<MetricKind, MetricSample> {
        let mut current: HashMap<MetricKind, MetricSample> = HashMap::new();
        for entry in self.latest.iter() {
            let sample = entry.value();
            match current.get(&sample.kind) {
                Some(existing)
                    if (existing.timestamp, existing.name.as_str())
                        >= (sample.timestamp, sample.name.as_str()) => {}
                _ => {
                    current.insert(sample.kind, sample.clone());
                }
            }
        }
        current
    }

    /// Every cached sample, ordered by name
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> =
            self.latest.iter().map(|e| e.value().clone()).collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name));
        samples
    }

    /// Stored records of `kind` within `[start, end]`, oldest first
    ///
    /// Pending appends are drained first so callers read their own writes.
    pub fn query(
        &self,
        kind: Option<MetricKind>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        self.flush();
        self.repository.query_metrics(kind, start, end)
    }

    /// Delete stored records older than `cutoff`
    pub fn delete_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        self.flush();
        self.repository.delete_metrics_before(cutoff)
    }

    /// Wait until every queued append has reached the repository
    ///
    /// # Returns
    ///
    /// `false` if the writer did not answer within the flush timeout
    pub fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let sender = self.read_sender();
            let Some(sender) = sender.as_ref() else {
                return true;
            };
            // The marker queues behind every earlier append, so its ack means
            // they have all been handed to the repository
            if sender.send(WriterMessage::Flush(ack_tx)).is_err() {
                return true;
            }
        }

        match ack_rx.recv_timeout(FLUSH_TIMEOUT) {
            Ok(()) => true,
            Err(e) => {
                warn!("Metric writer did not drain in time: {}", e);
                false
            }
        }
    }

    /// Drain pending appends and stop the writer thread
    pub fn shutdown(&self) {
        // Later writes see no sender and append inline
        if let Some(sender) = self.take_sender() {
            let _ = sender.send(WriterMessage::Shutdown);
        }

        let thread = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Metric writer thread panicked");
            }
            debug!("Metric writer stopped");
        }
    }

    fn classify(&self, sample: &MetricSample) -> MetricRecord {
        let status = match self.thresholds.get(&sample.name) {
            Some(t) if sample.value >= t.critical => MetricStatus::Critical,
            Some(t) if sample.value >= t.warning => MetricStatus::Warning,
            _ => MetricStatus::Normal,
        };

        MetricRecord {
            sample: sample.clone(),
            status,
            severity: Severity::from(status),
            description: format!("{} {:.2}{}", sample.name, sample.value, sample.unit),
            tags: sample.labels.clone(),
        }
    }

    fn read_sender(&self) -> RwLockReadGuard<'_, Option<Sender<WriterMessage>>> {
        self.sender.read().unwrap_or_else(|p| p.into_inner())
    }

    fn take_sender(&self) -> Option<Sender<WriterMessage>> {
        self.sender.write().unwrap_or_else(|p| p.into_inner()).take()
    }
}

impl Drop for MetricStore {
    fn drop(&mut self) {
        if let Some(sender) = self.take_sender() {
            let _ = sender.send(WriterMessage::Shutdown);
        }
    }
}

fn run_writer(repository: Arc<dyn Repository>, receiver: Receiver<WriterMessage>) {
    let mut failures: u64 = 0;
    // Handled in send order; a closed channel ends the loop
    while let Ok(message) = receiver.recv() {
        match message {
            WriterMessage::Append(record) => {
                if let Err(e) = repository.append_metric(&record) {
                    failures += 1;
                    error!(
                        "Failed to persist metric '{}' ({} failures so far): {}",
                        record.sample.name, failures, e
                    );
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            WriterMessage::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::repository::{MemoryRepository, MockRepository};
    use chrono::{Duration as ChronoDuration, Utc};

    fn thresholds() -> BTreeMap<String, MetricThreshold> {
        let mut t = BTreeMap::new();
        t.insert(
            "cpu_usage".to_string(),
            MetricThreshold {
                warning: 70.0,
                critical: 90.0,
            },
        );
        t
    }

    #[test]
    fn test_latest_reflects_last_write() {
        let store = MetricStore::new(Arc::new(MemoryRepository::new()), thresholds()).unwrap();
        assert!(store.latest("cpu_usage").is_none());

        store.write(MetricSample::new(MetricKind::System, "cpu_usage", 10.0, "%"));
        store.write(MetricSample::new(MetricKind::System, "cpu_usage", 20.0, "%"));

        assert_eq!(store.latest("cpu_usage").unwrap().value, 20.0);
        store.shutdown();
    }

    #[test]
    fn test_query_reads_own_writes_with_status() {
        let repo = Arc::new(MemoryRepository::new());
        let store = MetricStore::new(repo.clone(), thresholds()).unwrap();
        let now = Utc::now();

        store.write(MetricSample::new(MetricKind::System, "cpu_usage", 95.0, "%").at(now));
        store.write(
            MetricSample::new(MetricKind::System, "cpu_usage", 75.0, "%")
                .at(now - ChronoDuration::seconds(5)),
        );
        store.write(MetricSample::new(MetricKind::Business, "active_users", 3.0, "").at(now));

        let records = store
            .query(
                Some(MetricKind::System),
                now - ChronoDuration::minutes(1),
                now,
            )
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sample.value, 75.0);
        assert_eq!(records[0].status, MetricStatus::Warning);
        assert_eq!(records[1].status, MetricStatus::Critical);
        assert_eq!(records[1].severity, Severity::Critical);
        store.shutdown();
    }

    #[test]
    fn test_query_inverted_range_is_empty() {
        let store = MetricStore::new(Arc::new(MemoryRepository::new()), thresholds()).unwrap();
        let now = Utc::now();
        store.write(MetricSample::new(MetricKind::System, "cpu_usage", 1.0, "%").at(now));
        assert!(store
            .query(None, now, now - ChronoDuration::hours(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_current_picks_newest_per_kind() {
        let store = MetricStore::new(Arc::new(MemoryRepository::new()), BTreeMap::new()).unwrap();
        let now = Utc::now();
        store.write(
            MetricSample::new(MetricKind::System, "cpu_usage", 1.0, "%")
                .at(now - ChronoDuration::seconds(1)),
        );
        store.write(MetricSample::new(MetricKind::System, "memory_usage", 2.0, "%").at(now));
        store.write(MetricSample::new(MetricKind::Custom, "queue", 3.0, "").at(now));

        let current = store.current();
        assert_eq!(current.len(), 2);
        assert_eq!(current[&MetricKind::System].name, "memory_usage");
        assert_eq!(current[&MetricKind::Custom].value, 3.0);
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn test_append_failure_keeps_cache() {
        let mut repo = MockRepository::new();
        repo.expect_append_metric()
            .returning(|_| Err(StoreError::Unavailable("disk full".to_string())));

        let store = MetricStore::new(Arc::new(repo), BTreeMap::new()).unwrap();
        store.write(MetricSample::new(MetricKind::Custom, "queue", 7.0, ""));
        assert!(store.flush());
        assert_eq!(store.latest("queue").unwrap().value, 7.0);
        store.shutdown();
    }

    #[test]
    fn test_write_after_shutdown_appends_inline() {
        let repo = Arc::new(MemoryRepository::new());
        let store = MetricStore::new(repo.clone(), BTreeMap::new()).unwrap();
        store.shutdown();

        store.write(MetricSample::new(MetricKind::Custom, "late", 1.0, ""));
        assert_eq!(repo.metric_count(), 1);
        assert!(store.flush());
    }

    #[test]
    fn test_concurrent_writers_to_distinct_keys() {
        let store = Arc::new(MetricStore::new(Arc::new(MemoryRepository::new()), BTreeMap::new()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for n in 0..50 {
                        store.write(MetricSample::new(
                            MetricKind::Custom,
                            format!("metric_{}", i),
                            f64::from(n),
                            "",
                        ));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8 {
            assert_eq!(store.latest(&format!("metric_{}", i)).unwrap().value, 49.0);
        }
        let now = Utc::now();
        let stored = store
            .query(None, now - ChronoDuration::minutes(1), now)
            .unwrap();
        assert_eq!(stored.len(), 400);
        store.shutdown();
    }

    #[test]
    fn test_writers_do_not_wait_on_each_other() {
        let repo = Arc::new(MemoryRepository::new());
        let store = MetricStore::new(repo.clone(), BTreeMap::new()).unwrap();

        // Another writer is mid-send and still holds the queue
        let held = store.read_sender();
        thread::scope(|scope| {
            for i in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    store.write(MetricSample::new(
                        MetricKind::Custom,
                        format!("metric_{}", i),
                        1.0,
                        "",
                    ));
                });
            }
        });
        drop(held);

        assert_eq!(store.snapshot().len(), 8);
        assert!(store.flush());
        assert_eq!(repo.metric_count(), 8);
        store.shutdown();
    }
}
