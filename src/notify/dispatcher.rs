use crate::config::NotificationConfig;
use crate::error::NotificationError;
use crate::model::{Alert, NotificationRecord, NotificationStatus};
use crate::monitoring::MonitoringStats;
use crate::notify::channels::NotificationChannel;
use crate::notify::content::NotificationContent;
use crate::store::{IdSequence, Repository};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Retry policy for one notification target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotificationConfig::default())
    }
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// A parsed `channel` or `channel:recipient` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub channel: String,
    pub recipient: String,
}

impl ChannelTarget {
    pub fn parse(target: &str) -> Self {
        match target.split_once(':') {
            Some((channel, recipient)) => Self {
                channel: channel.trim().to_string(),
                recipient: recipient.trim().to_string(),
            },
            None => Self {
                channel: target.trim().to_string(),
                recipient: String::new(),
            },
        }
    }
}

/// Turns alert events into notification records and delivers them in the background
///
/// `dispatch` returns immediately. Each target gets its own task and its own
/// record, which is updated on every attempt. Delivery failures stay on the
/// record and in the stats.
pub struct NotificationDispatcher {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    repository: Arc<dyn Repository>,
    stats: Arc<MonitoringStats>,
    ids: IdSequence,
    policy: RetryPolicy,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher over a fixed set of channels
    ///
    /// # Arguments
    ///
    /// * `channels` - Available channels, addressed by their `name()`
    /// * `repository` - Storage for notification records
    /// * `stats` - Shared engine counters
    /// * `policy` - Retry policy per target
    /// * `last_id` - Highest notification id already stored
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        repository: Arc<dyn Repository>,
        stats: Arc<MonitoringStats>,
        policy: RetryPolicy,
        last_id: u64,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            channels,
            repository,
            stats,
            ids: IdSequence::starting_after(last_id),
            policy,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Names of the registered channels, sorted
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start delivering `alert` to every target
    ///
    /// # Returns
    ///
    /// Number of notification records created
    pub fn dispatch(self: &Arc<Self>, alert: &Alert, targets: &[String]) -> usize {
        if targets.is_empty() {
            debug!("Alert {} ({}) has no notification targets", alert.id, alert.rule_name);
            return 0;
        }

        // Rendered once and shared by every target
        let content = Arc::new(NotificationContent::for_alert(alert));
        // Called from the blocking evaluation thread, so look the runtime up
        let runtime = tokio::runtime::Handle::try_current();

        for target in targets {
            let target = ChannelTarget::parse(target);
            let now = Utc::now();
            let record = NotificationRecord {
                id: self.ids.next_id(),
                alert_id: alert.id,
                channel: target.channel.clone(),
                recipient: target.recipient.clone(),
                status: NotificationStatus::Pending,
                content: content.render(),
                attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            // The Pending record exists before the first attempt
            if let Err(e) = self.repository.create_notification(&record) {
                error!(
                    "Failed to store notification record {} for alert {}: {}",
                    record.id, alert.id, e
                );
            }

            match &runtime {
                Ok(handle) => {
                    let dispatcher = Arc::clone(self);
                    let channel = self.channels.get(&target.channel).cloned();
                    let content = Arc::clone(&content);
                    let task = handle.spawn(async move {
                        dispatcher.deliver(record, channel, content).await;
                    });
                    self.track(task);
                }
                Err(_) => {
                    warn!(
                        "No async runtime available; notification {} for alert {} not delivered",
                        record.id, alert.id
                    );
                    self.finish(
                        record,
                        Err(NotificationError::DeliveryFailed(
                            "no async runtime available".to_string(),
                        )),
                    );
                }
            }
        }

        targets.len()
    }

    /// Wait for every in-flight delivery, including ones started while waiting
    pub async fn wait_idle(&self) {
        loop {
            // Deliveries started meanwhile land in the next batch
            let handles = std::mem::take(&mut *self.lock_in_flight());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Notification task failed: {}", e);
                }
            }
        }
    }

    /// Number of deliveries not yet finished
    pub fn pending(&self) -> usize {
        self.lock_in_flight()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    async fn deliver(
        &self,
        mut record: NotificationRecord,
        channel: Option<Arc<dyn NotificationChannel>>,
        content: Arc<NotificationContent>,
    ) {
        // Unknown channel: fail at once, retrying cannot help
        let Some(channel) = channel else {
            let err = NotificationError::UnknownChannel(record.channel.clone());
            self.finish(record, Err(err));
            return;
        };

        loop {
            record.attempts += 1;
            let result = channel.send(&record.recipient, &content).await;

            match result {
                Ok(()) => {
                    self.finish(record, Ok(()));
                    return;
                }
                // Out of attempts: the record keeps the last error
                Err(e) if record.attempts >= self.policy.max_attempts => {
                    self.finish(record, Err(e));
                    return;
                }
                Err(e) => {
                    let delay = self.policy.backoff(record.attempts);
                    warn!(
                        "Notification {} via '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        record.id, record.channel, record.attempts, self.policy.max_attempts, delay, e
                    );
                    // Visible as Retrying while we back off
                    record.status = NotificationStatus::Retrying;
                    record.last_error = Some(e.to_string());
                    record.updated_at = Utc::now();
                    self.save(&record);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn finish(&self, mut record: NotificationRecord, outcome: Result<(), NotificationError>) {
        record.updated_at = Utc::now();
        match outcome {
            Ok(()) => {
                record.status = NotificationStatus::Sent;
                info!(
                    "Notification {} for alert {} sent via '{}' after {} attempt(s)",
                    record.id, record.alert_id, record.channel, record.attempts
                );
                self.stats.record_notification(true);
            }
            Err(e) => {
                record.status = NotificationStatus::Failed;
                record.last_error = Some(e.to_string());
                error!(
                    "Notification {} for alert {} via '{}' failed: {}",
                    record.id, record.alert_id, record.channel, e
                );
                self.stats.record_notification(false);
            }
        }
        self.save(&record);
    }

    fn save(&self, record: &NotificationRecord) {
        if let Err(e) = self.repository.save_notification(record) {
            error!("Failed to update notification record {}: {}", record.id, e);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(task);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertStatus, Severity};
    use crate::notify::channels::MockChannel;
    use crate::store::MemoryRepository;

    fn alert(id: u64) -> Alert {
        let now = Utc::now();
        Alert {
            id,
            rule_id: 1,
            rule_name: "High CPU".to_string(),
            metric_name: "cpu_usage".to_string(),
            value: 95.0,
            threshold: 80.0,
            condition: ">".to_string(),
            severity: Severity::Critical,
            status: AlertStatus::Active,
            message: "High CPU: cpu_usage = 95.00 > 80.00".to_string(),
            fired_at: now,
            updated_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            escalation_level: 0,
            last_escalated_at: None,
            suppressed: false,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn dispatcher(
        channels: Vec<Arc<dyn NotificationChannel>>,
        policy: RetryPolicy,
    ) -> (Arc<NotificationDispatcher>, Arc<MemoryRepository>, Arc<MonitoringStats>) {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(MonitoringStats::new());
        let d = Arc::new(NotificationDispatcher::new(
            channels,
            repo.clone(),
            stats.clone(),
            policy,
            0,
        ));
        (d, repo, stats)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(60), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            ChannelTarget::parse("webhook:ops-team"),
            ChannelTarget {
                channel: "webhook".to_string(),
                recipient: "ops-team".to_string()
            }
        );
        assert_eq!(ChannelTarget::parse("log").recipient, "");
        assert_eq!(ChannelTarget::parse("email:a:b").recipient, "a:b");
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let mock = Arc::new(MockChannel::succeeding("mock"));
        let (d, repo, stats) = dispatcher(vec![mock.clone()], fast_policy(3));

        let created = d.dispatch(&alert(1), &["mock:oncall".to_string()]);
        assert_eq!(created, 1);
        d.wait_idle().await;

        let records = repo.notifications_for_alert(1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, NotificationStatus::Sent);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(records[0].recipient, "oncall");
        assert!(records[0].content.starts_with("[CRITICAL] High CPU"));
        assert_eq!(mock.deliveries()[0].recipient, "oncall");
        assert_eq!(stats.snapshot().notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = Arc::new(MockChannel::failing_first("flaky", 2));
        let (d, repo, _) = dispatcher(vec![mock.clone()], fast_policy(3));

        d.dispatch(&alert(2), &["flaky".to_string()]);
        d.wait_idle().await;

        let record = &repo.notifications_for_alert(2).unwrap()[0];
        assert_eq!(record.status, NotificationStatus::Sent);
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.is_some());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let mock = Arc::new(MockChannel::always_failing("broken"));
        let (d, repo, stats) = dispatcher(vec![mock.clone()], fast_policy(3));

        d.dispatch(&alert(3), &["broken".to_string()]);
        d.wait_idle().await;

        let record = &repo.notifications_for_alert(3).unwrap()[0];
        assert_eq!(record.status, NotificationStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(stats.snapshot().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_fails_immediately() {
        let (d, repo, _) = dispatcher(vec![], fast_policy(3));

        d.dispatch(&alert(4), &["pager:ops".to_string()]);
        d.wait_idle().await;

        let record = &repo.notifications_for_alert(4).unwrap()[0];
        assert_eq!(record.status, NotificationStatus::Failed);
        assert_eq!(record.attempts, 0);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("Unknown notification channel"));
    }

    #[tokio::test]
    async fn test_one_record_per_target() {
        let a = Arc::new(MockChannel::succeeding("a"));
        let b = Arc::new(MockChannel::always_failing("b"));
        let (d, repo, _) = dispatcher(vec![a.clone(), b.clone()], fast_policy(1));

        d.dispatch(&alert(5), &["a".to_string(), "b".to_string(), "a:x".to_string()]);
        d.wait_idle().await;

        let records = repo.notifications_for_alert(5).unwrap();
        assert_eq!(records.len(), 3);
        let sent = records
            .iter()
            .filter(|r| r.status == NotificationStatus::Sent)
            .count();
        assert_eq!(sent, 2);
        assert_eq!(a.deliveries().len(), 2);
        assert_eq!(d.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_targets_creates_nothing() {
        let (d, repo, _) = dispatcher(vec![], fast_policy(1));
        assert_eq!(d.dispatch(&alert(6), &[]), 0);
        assert!(repo.notifications_for_alert(6).unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_without_runtime_marks_failed() {
        let mock = Arc::new(MockChannel::succeeding("mock"));
        let (d, repo, _) = dispatcher(vec![mock.clone()], fast_policy(1));

        d.dispatch(&alert(7), &["mock".to_string()]);
        let record = &repo.notifications_for_alert(7).unwrap()[0];
        assert_eq!(record.status, NotificationStatus::Failed);
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_channel_names() {
        let (d, _, _) = dispatcher(
            vec![
                Arc::new(MockChannel::succeeding("webhook")),
                Arc::new(crate::notify::channels::LogChannel),
            ],
            fast_policy(1),
        );
        assert_eq!(d.channel_names(), vec!["log", "webhook"]);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_backoff_is_monotonic_and_capped(base_ms: u16, cap_ms: u16, attempt: u8) -> bool {
        let base = Duration::from_millis(u64::from(base_ms));
        let cap = Duration::from_millis(u64::from(cap_ms).max(u64::from(base_ms)));
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: base,
            max_backoff: cap,
        };
        let attempt = u32::from(attempt).max(1);
        let current = policy.backoff(attempt);
        let next = policy.backoff(attempt + 1);
        current <= next && next <= cap && (attempt > 1 || current == base)
    }
}
