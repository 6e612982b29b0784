use crate::error::MonitorError;
use crate::model::{Alert, AlertStatus, Timestamp};
use crate::monitoring::MonitoringStats;
use crate::notify::NotificationDispatcher;
use crate::store::{IdSequence, Repository};
use crate::triggers::AlertRule;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a trigger or refresh did to the rule's alert
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A new alert was opened and notified
    Created(Alert),
    /// A new alert was opened inside the suppression window, without notification
    Suppressed(Alert),
    /// The open alert's value was updated in place
    Updated(Alert),
    /// The open alert escalated one level and was notified again
    Escalated(Alert),
}

impl TriggerOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            TriggerOutcome::Created(a)
            | TriggerOutcome::Suppressed(a)
            | TriggerOutcome::Updated(a)
            | TriggerOutcome::Escalated(a) => a,
        }
    }

    fn notifies(&self) -> bool {
        matches!(self, TriggerOutcome::Created(_) | TriggerOutcome::Escalated(_))
    }
}

#[derive(Debug, Default)]
struct RuleSlot {
    /// Active or acknowledged alert for the rule
    open: Option<Alert>,
    last_resolved_at: Option<Timestamp>,
}

/// Owns the active-alert table and applies the alert state machine
///
/// `Active -> Acknowledged -> Resolved` and `Active -> Resolved`. Each rule
/// name has its own mutex, so unrelated rules never contend. Transitions
/// driven by the evaluation loop commit in memory even if persistence fails;
/// transitions requested through the API persist first and fail without
/// touching memory.
pub struct AlertManager {
    slots: DashMap<String, Arc<Mutex<RuleSlot>>>,
    /// Open alert id -> rule name
    index: DashMap<u64, String>,
    ids: IdSequence,
    repository: Arc<dyn Repository>,
    dispatcher: Arc<NotificationDispatcher>,
    stats: Arc<MonitoringStats>,
}

impl AlertManager {
    /// # Arguments
    ///
    /// * `repository` - Storage for alert rows
    /// * `dispatcher` - Receives newly fired and escalated alerts
    /// * `stats` - Shared engine counters
    /// * `last_id` - Highest alert id already stored
    pub fn new(
        repository: Arc<dyn Repository>,
        dispatcher: Arc<NotificationDispatcher>,
        stats: Arc<MonitoringStats>,
        last_id: u64,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            index: DashMap::new(),
            ids: IdSequence::starting_after(last_id),
            repository,
            dispatcher,
            stats,
        }
    }

    /// Put open alerts loaded from storage back into the active table
    ///
    /// # Returns
    ///
    /// Number of alerts restored
    pub fn restore(&self, alerts: Vec<Alert>) -> usize {
        let mut restored = 0;
        for alert in alerts.into_iter().filter(|a| a.status.is_open()) {
            let slot = self.slot(&alert.rule_name);
            let mut guard = lock(&slot);
            // One open alert per rule, even in a damaged store
            if guard.open.is_some() {
                warn!(
                    "Skipping restored alert {}: rule '{}' already has an open alert",
                    alert.id, alert.rule_name
                );
                continue;
            }
            self.index.insert(alert.id, alert.rule_name.clone());
            guard.open = Some(alert);
            self.stats.alert_restored();
            restored += 1;
        }
        restored
    }

    pub fn trigger(&self, rule: &AlertRule, value: f64) -> TriggerOutcome {
        self.trigger_at(rule, value, Utc::now())
    }

    /// Open an alert for `rule`, or update the open one in place
    ///
    /// # Arguments
    ///
    /// * `rule` - Rule that fired
    /// * `value` - Metric value that satisfied the rule
    /// * `now` - Transition time
    pub fn trigger_at(&self, rule: &AlertRule, value: f64, now: Timestamp) -> TriggerOutcome {
        let slot = self.slot(&rule.name);
        let outcome = {
            let mut guard = lock(&slot);
            let state = &mut *guard;
            match state.open.as_mut() {
                // Still open: update in place, maybe escalate
                Some(alert) => self.update_open(alert, rule, value, now),
                None => {
                    // Suppressed only when the previous alert of this rule was
                    // resolved less than one window ago. A window end past the
                    // representable range counts as still inside it.
                    let suppressed = rule.suppression
                        && state.last_resolved_at.map_or(false, |resolved| {
                            resolved
                                .checked_add_signed(rule.suppression_window())
                                .map_or(true, |until| now < until)
                        });
                    let alert = self.open_new(rule, value, now, suppressed);
                    state.open = Some(alert.clone());
                    if suppressed {
                        TriggerOutcome::Suppressed(alert)
                    } else {
                        TriggerOutcome::Created(alert)
                    }
                }
            }
        };

        self.notify(rule, &outcome);
        outcome
    }

    pub fn refresh(&self, rule: &AlertRule, value: f64) -> Option<TriggerOutcome> {
        self.refresh_at(rule, value, Utc::now())
    }

    /// Update the open alert for a rule that is still triggered
    ///
    /// Never opens a new alert: one resolved by a user stays resolved until
    /// the rule clears and fires again.
    pub fn refresh_at(&self, rule: &AlertRule, value: f64, now: Timestamp) -> Option<TriggerOutcome> {
        let slot = self.existing_slot(&rule.name)?;
        let outcome = {
            let mut guard = lock(&slot);
            let alert = guard.open.as_mut()?;
            self.update_open(alert, rule, value, now)
        };

        self.notify(rule, &outcome);
        Some(outcome)
    }

    pub fn clear(&self, rule_name: &str) -> Option<Alert> {
        self.clear_at(rule_name, Utc::now())
    }

    /// Resolve the rule's open alert on behalf of the system
    ///
    /// # Returns
    ///
    /// The resolved alert, or `None` if the rule had no open alert
    pub fn clear_at(&self, rule_name: &str, now: Timestamp) -> Option<Alert> {
        let slot = self.existing_slot(rule_name)?;
        let mut guard = lock(&slot);
        let mut alert = guard.open.take()?;

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = Some("system".to_string());
        alert.updated_at = now;
        // Loop transition: commits even when the write fails
        if let Err(e) = self.repository.save_alert(&alert) {
            error!("Failed to persist resolution of alert {}: {}", alert.id, e);
        }

        guard.last_resolved_at = Some(now);
        self.index.remove(&alert.id);
        self.stats.alert_closed();
        info!("Alert {} ({}) cleared", alert.id, alert.rule_name);
        Some(alert)
    }

    pub fn acknowledge(&self, alert_id: u64, user: &str) -> Result<Alert, MonitorError> {
        self.acknowledge_at(alert_id, user, Utc::now())
    }

    /// Move an active alert to acknowledged
    ///
    /// # Errors
    ///
    /// * `InvalidTransition` if the alert is already acknowledged or resolved
    /// * `AlertNotFound` if no alert has that id
    /// * `Persistence` if the change could not be stored (memory unchanged)
    pub fn acknowledge_at(
        &self,
        alert_id: u64,
        user: &str,
        now: Timestamp,
    ) -> Result<Alert, MonitorError> {
        let slot = self.locate(alert_id)?;
        let mut guard = lock(&slot);
        let current = match guard.open.as_ref() {
            Some(alert) if alert.id == alert_id => alert,
            _ => return Err(self.closed_alert_error(alert_id)),
        };
        if current.status != AlertStatus::Active {
            return Err(MonitorError::InvalidTransition(format!(
                "alert {} is already acknowledged",
                alert_id
            )));
        }

        let mut updated = current.clone();
        updated.status = AlertStatus::Acknowledged;
        updated.acknowledged_at = Some(now);
        updated.acknowledged_by = Some(user.to_string());
        updated.updated_at = now;
        // Persist first; a failed write leaves memory untouched
        self.repository.save_alert(&updated)?;

        guard.open = Some(updated.clone());
        info!("Alert {} acknowledged by {}", alert_id, user);
        Ok(updated)
    }

    pub fn resolve(&self, alert_id: u64, user: &str) -> Result<Alert, MonitorError> {
        self.resolve_at(alert_id, user, Utc::now())
    }

    /// Resolve an active or acknowledged alert
    ///
    /// # Errors
    ///
    /// * `InvalidTransition` if the alert is already resolved
    /// * `AlertNotFound` if no alert has that id
    /// * `Persistence` if the change could not be stored (memory unchanged)
    pub fn resolve_at(
        &self,
        alert_id: u64,
        user: &str,
        now: Timestamp,
    ) -> Result<Alert, MonitorError> {
        let slot = self.locate(alert_id)?;
        let mut guard = lock(&slot);
        let current = match guard.open.as_ref() {
            Some(alert) if alert.id == alert_id => alert,
            _ => return Err(self.closed_alert_error(alert_id)),
        };

        let mut resolved = current.clone();
        resolved.status = AlertStatus::Resolved;
        resolved.resolved_at = Some(now);
        resolved.resolved_by = Some(user.to_string());
        resolved.updated_at = now;
        // Persist first, as for acknowledge
        self.repository.save_alert(&resolved)?;

        guard.open = None;
        guard.last_resolved_at = Some(now);
        self.index.remove(&alert_id);
        self.stats.alert_closed();
        info!("Alert {} resolved by {}", alert_id, user);
        Ok(resolved)
    }

    /// Active and acknowledged alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let slots: Vec<Arc<Mutex<RuleSlot>>> =
            self.slots.iter().map(|e| Arc::clone(e.value())).collect();

        let mut alerts: Vec<Alert> = slots
            .iter()
            .filter_map(|slot| lock(slot).open.clone())
            .collect();
        alerts.sort_by_key(|a| (a.fired_at, a.id));
        alerts
    }

    /// The open alert for a rule, if any
    pub fn open_alert(&self, rule_name: &str) -> Option<Alert> {
        let slot = self.existing_slot(rule_name)?;
        let alert = lock(&slot).open.clone();
        alert
    }

    pub fn active_count(&self) -> usize {
        self.index.len()
    }

    /// Number of rule names with per-rule state
    pub fn tracked_rules(&self) -> usize {
        self.slots.len()
    }

    /// Drop the state kept for a rule that no longer exists
    ///
    /// Only a slot without an open alert is removed; clear the alert first.
    /// The caller must make sure the rule is no longer evaluated.
    ///
    /// # Returns
    ///
    /// `true` if the slot was removed
    pub fn forget_rule(&self, rule_name: &str) -> bool {
        let removed = self
            .slots
            .remove_if(rule_name, |_, slot| lock(slot).open.is_none())
            .is_some();
        if removed {
            debug!("Dropped alert state for rule '{}'", rule_name);
        }
        removed
    }

    fn open_new(&self, rule: &AlertRule, value: f64, now: Timestamp, suppressed: bool) -> Alert {
        let alert = Alert {
            id: self.ids.next_id(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            metric_name: rule.metric_name.clone(),
            value,
            threshold: rule.threshold,
            condition: rule.condition.symbol().to_string(),
            severity: rule.severity,
            status: AlertStatus::Active,
            message: rule.describe(value),
            fired_at: now,
            updated_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            escalation_level: 0,
            last_escalated_at: None,
            suppressed,
        };

        if let Err(e) = self.repository.create_alert(&alert) {
            error!("Failed to persist new alert {} ({}): {}", alert.id, alert.rule_name, e);
        }
        self.index.insert(alert.id, alert.rule_name.clone());
        self.stats.alert_opened();

        if suppressed {
            info!(
                "Alert {} ({}) fired inside suppression window; not notifying",
                alert.id, alert.rule_name
            );
        } else {
            info!("Alert {} fired: {}", alert.id, alert.message);
        }
        alert
    }

    fn update_open(
        &self,
        alert: &mut Alert,
        rule: &AlertRule,
        value: f64,
        now: Timestamp,
    ) -> TriggerOutcome {
        alert.value = value;
        alert.updated_at = now;

        // The delay runs from the last escalation, or from firing for the
        // first one. Acknowledged alerts never escalate.
        let since = alert.last_escalated_at.unwrap_or(alert.fired_at);
        let escalate = rule.escalation
            && alert.status == AlertStatus::Active
            && alert.escalation_level < rule.max_escalation_level
            && now.signed_duration_since(since) >= rule.escalation_delay();

        if escalate {
            alert.escalation_level += 1;
            alert.severity = alert.severity.escalate();
            alert.last_escalated_at = Some(now);
            warn!(
                "Alert {} ({}) escalated to level {} ({})",
                alert.id,
                alert.rule_name,
                alert.escalation_level,
                alert.severity.as_str()
            );
        }

        if let Err(e) = self.repository.save_alert(alert) {
            error!("Failed to persist update of alert {}: {}", alert.id, e);
        }

        if escalate {
            TriggerOutcome::Escalated(alert.clone())
        } else {
            TriggerOutcome::Updated(alert.clone())
        }
    }

    fn notify(&self, rule: &AlertRule, outcome: &TriggerOutcome) {
        if outcome.notifies() {
            self.dispatcher
                .dispatch(outcome.alert(), &rule.notification_channels);
        }
    }

    fn slot(&self, rule_name: &str) -> Arc<Mutex<RuleSlot>> {
        // Read path first; the entry API takes the shard's write lock
        if let Some(slot) = self.slots.get(rule_name) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(rule_name.to_string()).or_default().value())
    }

    fn existing_slot(&self, rule_name: &str) -> Option<Arc<Mutex<RuleSlot>>> {
        self.slots.get(rule_name).map(|slot| Arc::clone(slot.value()))
    }

    fn locate(&self, alert_id: u64) -> Result<Arc<Mutex<RuleSlot>>, MonitorError> {
        let rule_name = self.index.get(&alert_id).map(|e| e.value().clone());
        match rule_name {
            Some(name) => Ok(self.slot(&name)),
            None => Err(self.closed_alert_error(alert_id)),
        }
    }

    /// Error for an id that is not in the active table
    fn closed_alert_error(&self, alert_id: u64) -> MonitorError {
        match self.repository.find_alert(alert_id) {
            Ok(Some(alert)) if alert.status == AlertStatus::Resolved => {
                MonitorError::InvalidTransition(format!("alert {} is already resolved", alert_id))
            }
            Ok(Some(_)) => MonitorError::InvalidTransition(format!(
                "alert {} is not in the active alert table",
                alert_id
            )),
            Ok(None) => MonitorError::AlertNotFound(alert_id),
            Err(e) => MonitorError::Persistence(e),
        }
    }
}

fn lock(slot: &Mutex<RuleSlot>) -> MutexGuard<'_, RuleSlot> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}
