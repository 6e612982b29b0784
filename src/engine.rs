//! The monitoring engine: an explicitly owned instance tying collectors,
//! storage, rule evaluation, alert lifecycle and notifications together.

use crate::alerts::AlertManager;
use crate::collectors::{
    collect_with_timeout, ApplicationCollector, BusinessCollector, Collector, CustomCollector,
    SystemCollector, UsageRecorder,
};
use crate::config::Config;
use crate::error::MonitorError;
use crate::model::{Alert, Labels, MetricKind, MetricRecord, MetricSample, NotificationRecord, Timestamp};
use crate::monitoring::{MonitoringStats, MonitoringStatsSnapshot};
use crate::notify::{LogChannel, NotificationChannel, NotificationDispatcher, RetryPolicy, WebhookChannel};
use crate::report::{Report, ReportGenerator};
use crate::scheduler::Scheduler;
use crate::store::{IdSequence, JsonFileRepository, MemoryRepository, MetricStore, Repository};
use crate::triggers::{AlertRule, RuleEngine, RuleSignal};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;

/// What one cleanup tick removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub metrics_deleted: usize,
    pub alerts_deleted: usize,
}

/// Assembles a [`MonitoringEngine`]
pub struct EngineBuilder {
    config: Config,
    repository: Option<Arc<dyn Repository>>,
    collectors: Vec<Arc<dyn Collector>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    default_collectors: bool,
}

impl EngineBuilder {
    /// Use this repository instead of the one named by `storage.path`
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Register a channel; it replaces any built-in channel with the same name
    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Add the system, application and business collectors
    pub fn with_default_collectors(mut self) -> Self {
        self.default_collectors = true;
        self
    }

    /// Open storage, seed rules, restore open alerts and return the engine
    ///
    /// The engine is idle until [`MonitoringEngine::start`] is called.
    ///
    /// # Errors
    ///
    /// * `MonitorError::Configuration` if the configuration is invalid
    /// * `MonitorError::Persistence` if storage cannot be opened or read
    pub fn build(self) -> Result<Arc<MonitoringEngine>, MonitorError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| MonitorError::Configuration(e.to_string()))?;

        // Injected repository, else the configured file, else memory
        let repository: Arc<dyn Repository> = match self.repository {
            Some(repository) => repository,
            None => match &config.storage.path {
                Some(path) => Arc::new(JsonFileRepository::open(path)?),
                None => Arc::new(MemoryRepository::new()),
            },
        };
        let max_ids = repository.max_ids()?;
        let stats = Arc::new(MonitoringStats::new());

        // Built-ins first so user channels with the same name replace them
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];
        if let Some(url) = &config.notifications.webhook_url {
            let timeout = Duration::from_secs(config.notifications.webhook_timeout_seconds);
            let webhook = WebhookChannel::new(url.clone(), timeout)
                .map_err(|e| MonitorError::Configuration(format!("webhook channel: {}", e)))?;
            channels.push(Arc::new(webhook));
        }
        channels.extend(self.channels);

        let dispatcher = Arc::new(NotificationDispatcher::new(
            channels,
            Arc::clone(&repository),
            Arc::clone(&stats),
            RetryPolicy::from(&config.notifications),
            max_ids.notification,
        ));
        let alerts = AlertManager::new(
            Arc::clone(&repository),
            Arc::clone(&dispatcher),
            Arc::clone(&stats),
            max_ids.alert,
        );
        let store = MetricStore::new(Arc::clone(&repository), config.thresholds.clone())?;

        let usage = Arc::new(UsageRecorder::new());
        let custom = Arc::new(CustomCollector::new());
        let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
        if self.default_collectors {
            collectors.push(Arc::new(SystemCollector::new()));
            collectors.push(Arc::new(ApplicationCollector::new(Arc::clone(&usage))));
            collectors.push(Arc::new(BusinessCollector::new(Arc::clone(&usage))));
        }
        collectors.push(custom.clone());
        collectors.extend(self.collectors);

        let engine = MonitoringEngine {
            reports: ReportGenerator::new(Arc::clone(&repository)),
            rule_ids: IdSequence::starting_after(max_ids.rule),
            rules: RuleEngine::new(),
            rules_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
            config,
            repository,
            store,
            collectors,
            custom,
            usage,
            alerts,
            dispatcher,
            stats,
        };

        engine.seed_rules()?;

        let open = engine.repository.open_alerts()?;
        let names: Vec<String> = open.iter().map(|a| a.rule_name.clone()).collect();
        let restored = engine.alerts.restore(open);
        engine.rules.assume_triggered(names.iter().map(String::as_str));
        {
            let _guard = engine.lock_rules();
            // Restored alerts whose rule is gone or disabled are cleared here
            engine.reload_rules()?;
        }

        info!(
            "Monitoring engine ready: {} collectors, {} rules, {} open alerts restored, channels {:?}",
            engine.collectors.len(),
            engine.rules.rules().len(),
            restored,
            engine.dispatcher.channel_names()
        );
        Ok(Arc::new(engine))
    }
}

/// Metrics collection and alert-evaluation engine
pub struct MonitoringEngine {
    config: Config,
    repository: Arc<dyn Repository>,
    store: MetricStore,
    collectors: Vec<Arc<dyn Collector>>,
    custom: Arc<CustomCollector>,
    usage: Arc<UsageRecorder>,
    rules: RuleEngine,
    /// Serializes rule changes with evaluation ticks
    rules_lock: Mutex<()>,
    rule_ids: IdSequence,
    alerts: AlertManager,
    dispatcher: Arc<NotificationDispatcher>,
    reports: ReportGenerator,
    stats: Arc<MonitoringStats>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl MonitoringEngine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            repository: None,
            collectors: Vec::new(),
            channels: Vec::new(),
            default_collectors: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Newest cached sample per metric kind
    pub fn current_metrics(&self) -> HashMap<MetricKind, MetricSample> {
        self.store.current()
    }

    /// Every cached sample, ordered by name
    pub fn latest_metrics(&self) -> Vec<MetricSample> {
        self.store.snapshot()
    }

    /// Stored records of `kind` within `[start, end]`, oldest first
    ///
    /// An inverted range yields an empty result.
    pub fn metrics_by_time_range(
        &self,
        kind: MetricKind,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetricRecord>, MonitorError> {
        Ok(self.store.query(Some(kind), start, end)?)
    }

    /// Active and acknowledged alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    /// Alerts fired within `[start, end]` in any state
    pub fn alert_history(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Alert>, MonitorError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self.repository.alerts_fired_between(start, end)?)
    }

    /// Rules in effect, ordered by id
    pub fn alert_rules(&self) -> Vec<AlertRule> {
        self.rules.rules().all().to_vec()
    }

    /// Store a new rule and reload the rule set
    ///
    /// # Errors
    ///
    /// * `MonitorError::Configuration` for an invalid rule or a duplicate name
    /// * `MonitorError::Persistence` if the rule cannot be stored
    pub fn create_alert_rule(&self, mut rule: AlertRule) -> Result<AlertRule, MonitorError> {
        rule.validate()?;
        let _guard = self.lock_rules();

        let existing = self.repository.list_rules()?;
        if existing.iter().any(|r| r.name == rule.name) {
            return Err(MonitorError::Configuration(format!(
                "a rule named '{}' already exists",
                rule.name
            )));
        }

        let now = Utc::now();
        rule.id = self.rule_ids.next_id();
        rule.created_at = now;
        rule.updated_at = now;
        self.repository.create_rule(&rule)?;
        info!("Created alert rule {} '{}'", rule.id, rule.name);

        self.reload_rules()?;
        Ok(rule)
    }

    /// Replace the rule with id `id` and reload the rule set
    ///
    /// # Errors
    ///
    /// * `MonitorError::RuleNotFound` if no rule has that id
    /// * `MonitorError::Configuration` for an invalid rule or a name taken by another rule
    /// * `MonitorError::Persistence` if the rule cannot be stored
    pub fn update_alert_rule(&self, id: u64, mut rule: AlertRule) -> Result<AlertRule, MonitorError> {
        rule.validate()?;
        let _guard = self.lock_rules();

        let existing = self
            .repository
            .find_rule(id)?
            .ok_or(MonitorError::RuleNotFound(id))?;
        let taken = self
            .repository
            .list_rules()?
            .into_iter()
            .any(|r| r.id != id && r.name == rule.name);
        if taken {
            return Err(MonitorError::Configuration(format!(
                "a rule named '{}' already exists",
                rule.name
            )));
        }

        rule.id = id;
        rule.created_at = existing.created_at;
        if rule.created_by.is_empty() {
            rule.created_by = existing.created_by;
        }
        rule.updated_at = Utc::now();
        self.repository.save_rule(&rule)?;
        info!("Updated alert rule {} '{}'", rule.id, rule.name);

        self.reload_rules()?;
        // Renamed: the reload cleared any alert under the old name
        if existing.name != rule.name {
            self.alerts.forget_rule(&existing.name);
        }
        Ok(rule)
    }

    /// Delete a rule; its open alert, if any, is resolved by the system
    ///
    /// # Errors
    ///
    /// * `MonitorError::RuleNotFound` if no rule has that id
    /// * `MonitorError::Persistence` if the deletion cannot be stored
    pub fn delete_alert_rule(&self, id: u64) -> Result<(), MonitorError> {
        let _guard = self.lock_rules();
        let rule = self
            .repository
            .find_rule(id)?
            .ok_or(MonitorError::RuleNotFound(id))?;
        if !self.repository.delete_rule(id)? {
            return Err(MonitorError::RuleNotFound(id));
        }
        info!("Deleted alert rule {} '{}'", id, rule.name);

        // The reload clears the open alert; only then can the slot go
        self.reload_rules()?;
        self.alerts.forget_rule(&rule.name);
        Ok(())
    }

    pub fn acknowledge_alert(&self, alert_id: u64, user: &str) -> Result<Alert, MonitorError> {
        self.alerts.acknowledge(alert_id, user)
    }

    pub fn resolve_alert(&self, alert_id: u64, user: &str) -> Result<Alert, MonitorError> {
        self.alerts.resolve(alert_id, user)
    }

    /// Record a custom gauge
    ///
    /// The value is written to the metric store at once and re-emitted by the
    /// custom collector on every later collection tick.
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` for an invalid name or a non-finite value
    pub fn record_custom_metric(
        &self,
        kind: MetricKind,
        name: &str,
        value: f64,
        labels: Labels,
    ) -> Result<MetricSample, MonitorError> {
        let sample = self.custom.record(kind, name, value, labels)?;
        self.store.write(sample.clone());
        Ok(sample)
    }

    pub fn generate_report(&self, start: Timestamp, end: Timestamp) -> Result<Report, MonitorError> {
        self.store.flush();
        self.reports.generate(start, end)
    }

    pub fn monitoring_stats(&self) -> MonitoringStatsSnapshot {
        self.stats.snapshot()
    }

    /// Delivery history for one alert
    pub fn notifications_for_alert(&self, alert_id: u64) -> Result<Vec<NotificationRecord>, MonitorError> {
        Ok(self.repository.notifications_for_alert(alert_id)?)
    }

    /// Recorder that request handlers and business code report usage to
    pub fn usage(&self) -> Arc<UsageRecorder> {
        Arc::clone(&self.usage)
    }

    /// Wait until every in-flight notification delivery has finished
    pub async fn wait_for_notifications(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Run every collector once, in parallel, and write the samples
    ///
    /// # Returns
    ///
    /// Number of samples written
    pub async fn collect_now(&self) -> usize {
        let default_timeout = self.config.engine.collector_timeout();
        let mut runs = JoinSet::new();
        for collector in &self.collectors {
            let collector = Arc::clone(collector);
            let timeout = collector.timeout().unwrap_or(default_timeout);
            runs.spawn(async move {
                let result = collect_with_timeout(collector.as_ref(), timeout).await;
                (collector.name().to_string(), result)
            });
        }

        let mut written = 0;
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((name, Ok(samples))) => {
                    debug!("Collector '{}' produced {} samples", name, samples.len());
                    self.stats.record_collection_success(&name, samples.len());
                    written += samples.len();
                    for sample in samples {
                        self.store.write(sample);
                    }
                }
                Ok((name, Err(e))) => {
                    warn!("Collector '{}' failed: {}", name, e);
                    self.stats.record_collection_failure();
                }
                Err(e) => {
                    error!("Collector task panicked: {}", e);
                    self.stats.record_collection_failure();
                }
            }
        }
        written
    }

    /// Refresh the rule set from storage, evaluate every enabled rule against
    /// the latest values and apply the result
    ///
    /// If storage cannot be read the previous rule snapshot is used.
    ///
    /// # Returns
    ///
    /// Number of trigger, refresh and clear signals applied
    pub fn evaluate_now(&self) -> usize {
        let signals = {
            let _guard = self.lock_rules();
            if let Err(e) = self.reload_rules() {
                warn!("Keeping previous rule set: {}", e);
            }
            let signals = self.rules.evaluate(|name| self.store.latest(name));
            let count = signals.len();
            self.apply(signals);
            count
        };

        self.stats.record_evaluation_tick();
        if let Err(e) = self.repository.flush() {
            error!("Failed to flush repository after evaluation: {}", e);
        }
        signals
    }

    /// Apply retention to metric history and resolved alerts
    pub fn cleanup_now(&self) -> CleanupSummary {
        let now = Utc::now();
        let metrics_deleted = self
            .store
            .delete_before(now - self.config.engine.metric_retention())
            .unwrap_or_else(|e| {
                error!("Metric retention cleanup failed: {}", e);
                0
            });
        let alerts_deleted = self
            .repository
            .delete_resolved_alerts_before(now - self.config.engine.alert_retention())
            .unwrap_or_else(|e| {
                error!("Alert retention cleanup failed: {}", e);
                0
            });
        if let Err(e) = self.repository.flush() {
            error!("Failed to flush repository after cleanup: {}", e);
        }

        info!(
            "Cleanup removed {} metric records and {} resolved alerts",
            metrics_deleted, alerts_deleted
        );
        self.stats.log_summary();

        CleanupSummary {
            metrics_deleted,
            alerts_deleted,
        }
    }

    /// Start the collection, evaluation and cleanup loops
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(|p| p.into_inner());
        if scheduler.is_some() {
            warn!("Monitoring engine already started");
            return;
        }
        *scheduler = Some(Scheduler::start(self));
        info!("Monitoring engine started");
    }

    /// Whether the periodic loops are running
    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(false, Scheduler::is_running)
    }

    /// Stop the loops, wait for pending notifications and drain storage
    pub async fn shutdown(&self) {
        info!("Shutting down monitoring engine");
        let scheduler = self.scheduler.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        self.dispatcher.wait_idle().await;
        self.store.shutdown();
        if let Err(e) = self.repository.flush() {
            error!("Failed to flush repository on shutdown: {}", e);
        }
        self.stats.log_summary();
        info!("Monitoring engine stopped");
    }

    /// Insert configured rules whose names are not stored yet
    fn seed_rules(&self) -> Result<(), MonitorError> {
        let stored = self.repository.list_rules()?;
        for seed in &self.config.rules {
            if stored.iter().any(|r| r.name == seed.name) {
                continue;
            }
            let mut rule = seed.clone();
            let now = Utc::now();
            rule.id = self.rule_ids.next_id();
            rule.created_at = now;
            rule.updated_at = now;
            if rule.created_by.is_empty() {
                rule.created_by = "config".to_string();
            }
            self.repository.create_rule(&rule)?;
            info!("Seeded alert rule {} '{}' from configuration", rule.id, rule.name);
        }
        Ok(())
    }

    /// Load the stored rules into the rule engine; caller holds `rules_lock`
    fn reload_rules(&self) -> Result<(), MonitorError> {
        let rules = self.repository.list_rules()?;
        let signals = self.rules.reload(rules)?;
        self.apply(signals);
        Ok(())
    }

    fn apply(&self, signals: Vec<RuleSignal>) {
        // Each signal takes only its own rule's lock in the alert manager
        for signal in signals {
            match signal {
                RuleSignal::Trigger { rule, value } => {
                    self.alerts.trigger(&rule, value);
                }
                RuleSignal::Refresh { rule, value } => {
                    self.alerts.refresh(&rule, value);
                }
                RuleSignal::Clear { rule_name } => {
                    self.alerts.clear(&rule_name);
                }
            }
        }
    }

    fn lock_rules(&self) -> MutexGuard<'_, ()> {
        self.rules_lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::test_support::ScriptedCollector;
    use crate::model::{AlertStatus, Severity};
    use crate::triggers::Condition;
    use tempfile::TempDir;

    fn engine() -> Arc<MonitoringEngine> {
        MonitoringEngine::builder(Config::default()).build().unwrap()
    }

    fn cpu_rule() -> AlertRule {
        AlertRule::new("High CPU", "cpu_usage", Condition::Gt, 80.0, Severity::Critical)
    }

    #[tokio::test]
    async fn test_collect_now_writes_samples_and_counts_failures() {
        let ok = ScriptedCollector::new("ok", MetricKind::System, &[("cpu_usage", 42.0)]);
        let mut failing = ScriptedCollector::new("broken", MetricKind::Application, &[]);
        failing.fail = true;

        let engine = MonitoringEngine::builder(Config::default())
            .collector(Arc::new(ok))
            .collector(Arc::new(failing))
            .build()
            .unwrap();

        let written = engine.collect_now().await;
        assert_eq!(written, 1);
        assert_eq!(engine.current_metrics()[&MetricKind::System].value, 42.0);

        let stats = engine.monitoring_stats();
        // custom collector + ok succeed, broken fails
        assert_eq!(stats.total_collections, 3);
        assert_eq!(stats.failed_collections, 1);
        assert_eq!(stats.metric_count_by_collector["ok"], 1);
    }

    #[tokio::test]
    async fn test_slow_collector_times_out() {
        let mut slow = ScriptedCollector::new("slow", MetricKind::System, &[("cpu_usage", 1.0)]);
        slow.delay = Some(Duration::from_millis(200));
        slow.timeout = Some(Duration::from_millis(10));

        let engine = MonitoringEngine::builder(Config::default())
            .collector(Arc::new(slow))
            .build()
            .unwrap();

        assert_eq!(engine.collect_now().await, 0);
        assert_eq!(engine.monitoring_stats().failed_collections, 1);
        assert!(engine.current_metrics().is_empty());
    }

    #[test]
    fn test_rule_crud_validation() {
        let engine = engine();
        let created = engine.create_alert_rule(cpu_rule()).unwrap();
        assert!(created.id > 0);
        assert_eq!(engine.alert_rules().len(), 1);

        assert!(matches!(
            engine.create_alert_rule(cpu_rule()),
            Err(MonitorError::Configuration(_))
        ));
        let mut invalid = cpu_rule();
        invalid.name = "nan".to_string();
        invalid.threshold = f64::NAN;
        assert!(matches!(
            engine.create_alert_rule(invalid),
            Err(MonitorError::Configuration(_))
        ));

        let mut updated = cpu_rule();
        updated.threshold = 85.0;
        let updated = engine.update_alert_rule(created.id, updated).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(engine.alert_rules()[0].threshold, 85.0);

        assert!(matches!(
            engine.update_alert_rule(999, cpu_rule()),
            Err(MonitorError::RuleNotFound(999))
        ));
        assert!(matches!(
            engine.delete_alert_rule(999),
            Err(MonitorError::RuleNotFound(999))
        ));
        engine.delete_alert_rule(created.id).unwrap();
        assert!(engine.alert_rules().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_window_rejected_and_tick_survives() {
        // A stored rule that never went through validation
        let repo = Arc::new(MemoryRepository::new());
        let mut stored = AlertRule::new("a-bad", "a_load", Condition::Gt, 1.0, Severity::Warning);
        stored.id = 1;
        stored.suppression = true;
        stored.suppression_window_seconds = u64::MAX;
        repo.create_rule(&stored).unwrap();

        let engine = MonitoringEngine::builder(Config::default())
            .repository(repo)
            .build()
            .unwrap();
        assert!(matches!(
            engine.create_alert_rule(
                AlertRule::new("b-bad", "a_load", Condition::Gt, 1.0, Severity::Warning)
                    .with_suppression(u64::MAX)
            ),
            Err(MonitorError::Configuration(_))
        ));
        engine
            .create_alert_rule(AlertRule::new("z-good", "z_load", Condition::Gt, 1.0, Severity::Warning))
            .unwrap();

        let set = |name: &str, value: f64| {
            engine
                .record_custom_metric(MetricKind::Custom, name, value, Labels::new())
                .unwrap();
        };
        set("a_load", 5.0);
        engine.evaluate_now();
        set("a_load", 0.0);
        engine.evaluate_now();

        // Both fire in the same tick; a-bad lands inside its window
        set("a_load", 5.0);
        set("z_load", 5.0);
        engine.evaluate_now();
        let active = engine.active_alerts();
        assert_eq!(active.len(), 2);
        let bad = active.iter().find(|a| a.rule_name == "a-bad").unwrap();
        assert!(bad.suppressed);
        assert!(active.iter().any(|a| a.rule_name == "z-good" && !a.suppressed));
    }

    #[tokio::test]
    async fn test_deleting_rule_clears_its_alert() {
        let engine = engine();
        let rule = engine.create_alert_rule(cpu_rule()).unwrap();
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 95.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        let alert = engine.active_alerts()[0].clone();

        engine.delete_alert_rule(rule.id).unwrap();
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.alerts.tracked_rules(), 0);
        let history = engine
            .alert_history(alert.fired_at, Utc::now())
            .unwrap();
        assert_eq!(history[0].status, AlertStatus::Resolved);
        assert_eq!(history[0].resolved_by.as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn test_renaming_rule_drops_old_state() {
        let engine = engine();
        let rule = engine.create_alert_rule(cpu_rule()).unwrap();
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 95.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        assert_eq!(engine.alerts.tracked_rules(), 1);

        let mut renamed = cpu_rule();
        renamed.name = "CPU saturated".to_string();
        engine.update_alert_rule(rule.id, renamed).unwrap();
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.alerts.tracked_rules(), 0);

        engine.evaluate_now();
        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "CPU saturated");
        assert_eq!(engine.alerts.tracked_rules(), 1);
    }

    #[tokio::test]
    async fn test_disabling_rule_clears_its_alert() {
        let engine = engine();
        let rule = engine.create_alert_rule(cpu_rule()).unwrap();
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 95.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        assert_eq!(engine.active_alerts().len(), 1);

        engine.update_alert_rule(rule.id, cpu_rule().disabled()).unwrap();
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.monitoring_stats().active_alert_count, 0);
    }

    #[test]
    fn test_config_rules_seeded_once() {
        let mut config = Config::default();
        config.rules.push(cpu_rule());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchtower.json");
        config.storage.path = Some(path.clone());

        let first = MonitoringEngine::builder(config.clone()).build().unwrap();
        assert_eq!(first.alert_rules().len(), 1);
        assert_eq!(first.alert_rules()[0].created_by, "config");
        drop(first);

        let second = MonitoringEngine::builder(config).build().unwrap();
        assert_eq!(second.alert_rules().len(), 1);
    }

    #[tokio::test]
    async fn test_open_alerts_restored_after_restart() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("watchtower.json"));

        let alert_id = {
            let engine = MonitoringEngine::builder(config.clone()).build().unwrap();
            engine.create_alert_rule(cpu_rule()).unwrap();
            engine
                .record_custom_metric(MetricKind::System, "cpu_usage", 95.0, Labels::new())
                .unwrap();
            engine.evaluate_now();
            let id = engine.active_alerts()[0].id;
            engine.shutdown().await;
            id
        };

        let engine = MonitoringEngine::builder(config).build().unwrap();
        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, alert_id);
        assert_eq!(engine.monitoring_stats().active_alert_count, 1);

        // Still triggered: the next high value refreshes instead of re-firing
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 97.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        assert_eq!(engine.active_alerts()[0].id, alert_id);
        assert_eq!(engine.active_alerts()[0].value, 97.0);

        // New ids continue after the stored ones
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 10.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        engine
            .record_custom_metric(MetricKind::System, "cpu_usage", 99.0, Labels::new())
            .unwrap();
        engine.evaluate_now();
        assert!(engine.active_alerts()[0].id > alert_id);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_after_non_finite_samples() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("watchtower.json"));
        let collector = || {
            Arc::new(ScriptedCollector::new(
                "ratios",
                MetricKind::Custom,
                &[("ratio", f64::NAN), ("spread", f64::INFINITY)],
            ))
        };

        {
            let engine = MonitoringEngine::builder(config.clone())
                .collector(collector())
                .build()
                .unwrap();
            engine
                .create_alert_rule(AlertRule::new("Wide", "spread", Condition::Gt, 10.0, Severity::Warning))
                .unwrap();
            assert_eq!(engine.collect_now().await, 2);
            engine.evaluate_now();
            assert_eq!(engine.active_alerts()[0].value, f64::INFINITY);
            engine.shutdown().await;
        }

        let engine = MonitoringEngine::builder(config)
            .collector(collector())
            .build()
            .unwrap();
        assert_eq!(engine.active_alerts()[0].value, f64::INFINITY);
        let history = engine
            .metrics_by_time_range(MetricKind::Custom, Utc::now() - chrono::Duration::minutes(1), Utc::now())
            .unwrap();
        assert!(history.iter().any(|r| r.sample.name == "ratio" && r.sample.value.is_nan()));
        engine.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.engine.collection_interval_seconds = 0;
        assert!(matches!(
            MonitoringEngine::builder(config).build(),
            Err(MonitorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = engine();
        engine.start();
        engine.start();
        assert!(engine.is_running());

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown().await;
        assert!(!engine.is_running());
        assert!(engine.monitoring_stats().total_collections >= 1);
    }

    #[test]
    fn test_cleanup_applies_retention() {
        let engine = engine();
        engine
            .record_custom_metric(MetricKind::Custom, "queue_depth", 3.0, Labels::new())
            .unwrap();
        let summary = engine.cleanup_now();
        assert_eq!(summary, CleanupSummary::default());
    }
}
