use crate::error::MonitorError;
use crate::model::MetricSample;
use crate::triggers::rules::{AlertRule, RuleSet};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Misses tolerated between two "metric unavailable" log lines for one rule
pub const MISS_LOG_INTERVAL: u64 = 10;

/// Decision produced for one rule during an evaluation tick
#[derive(Debug, Clone, PartialEq)]
pub enum RuleSignal {
    /// The rule just crossed into the triggered state
    Trigger { rule: AlertRule, value: f64 },
    /// The rule was already triggered and still holds
    Refresh { rule: AlertRule, value: f64 },
    /// The rule was triggered and no longer holds (or was removed or disabled)
    Clear { rule_name: String },
}

impl RuleSignal {
    pub fn rule_name(&self) -> &str {
        match self {
            RuleSignal::Trigger { rule, .. } | RuleSignal::Refresh { rule, .. } => &rule.name,
            RuleSignal::Clear { rule_name } => rule_name,
        }
    }
}

#[derive(Debug, Default)]
struct RuleState {
    triggered: bool,
    consecutive: u32,
    misses: u64,
}

/// Decides, per tick, which rules trigger, refresh or clear
///
/// The engine never touches alerts itself; callers apply the returned
/// signals to the alert lifecycle.
pub struct RuleEngine {
    rules: RwLock<Arc<RuleSet>>,
    states: Mutex<HashMap<String, RuleState>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Create an engine with an empty rule set
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::default())),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The current rule snapshot
    pub fn rules(&self) -> Arc<RuleSet> {
        match self.rules.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the rule snapshot
    ///
    /// Rules that were triggered and are now gone or disabled produce a
    /// `Clear` signal; their tracked state is dropped.
    ///
    /// # Errors
    ///
    /// `MonitorError::Configuration` if the new rules contain duplicate names;
    /// the previous snapshot stays in place.
    pub fn reload(&self, rules: Vec<AlertRule>) -> Result<Vec<RuleSignal>, MonitorError> {
        let snapshot = Arc::new(RuleSet::new(rules)?);

        let mut signals = Vec::new();
        {
            let mut states = self.lock_states();
            // Forget rules that are gone or disabled; clear those still firing
            states.retain(|name, state| {
                let still_enabled = snapshot.get(name).map_or(false, |r| r.enabled);
                if !still_enabled && state.triggered {
                    signals.push(RuleSignal::Clear {
                        rule_name: name.clone(),
                    });
                }
                still_enabled
            });
        }

        let count = snapshot.len();
        match self.rules.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        debug!("Rule set reloaded: {} rules, {} cleared", count, signals.len());

        Ok(signals)
    }

    /// Mark rules as already triggered, e.g. for alerts restored from storage
    pub fn assume_triggered<'a>(&self, rule_names: impl IntoIterator<Item = &'a str>) {
        let mut states = self.lock_states();
        for name in rule_names {
            let state = states.entry(name.to_string()).or_default();
            state.triggered = true;
        }
    }

    /// Whether the named rule is currently in the triggered state
    pub fn is_triggered(&self, rule_name: &str) -> bool {
        self.lock_states()
            .get(rule_name)
            .map_or(false, |s| s.triggered)
    }

    /// Evaluate every enabled rule against the latest values
    ///
    /// # Arguments
    ///
    /// * `latest` - Lookup of the most recent sample for a metric name
    ///
    /// # Returns
    ///
    /// One signal per rule whose state changed or is still triggered
    pub fn evaluate<F>(&self, latest: F) -> Vec<RuleSignal>
    where
        F: Fn(&str) -> Option<MetricSample>,
    {
        let snapshot = self.rules();
        let mut states = self.lock_states();
        let mut signals = Vec::new();

        for rule in snapshot.enabled() {
            let state = states.entry(rule.name.clone()).or_default();

            let sample = latest(&rule.metric_name)
                .filter(|s| rule.metric_type.map_or(true, |kind| kind == s.kind));

            // No value: the rule keeps whatever state it had
            let Some(sample) = sample else {
                state.misses += 1;
                if state.misses % MISS_LOG_INTERVAL == 1 {
                    info!(
                        "Rule '{}': no value for metric '{}' ({} misses)",
                        rule.name, rule.metric_name, state.misses
                    );
                }
                continue;
            };

            // Condition false: reset the streak, clear if it was firing
            if !rule.matches(sample.value) {
                state.consecutive = 0;
                if state.triggered {
                    state.triggered = false;
                    signals.push(RuleSignal::Clear {
                        rule_name: rule.name.clone(),
                    });
                }
                continue;
            }

            // Already firing: keep the alert's value current
            if state.triggered {
                signals.push(RuleSignal::Refresh {
                    rule: rule.clone(),
                    value: sample.value,
                });
                continue;
            }

            // Fires once the streak reaches the rule's duration
            state.consecutive = state.consecutive.saturating_add(1);
            if state.consecutive >= rule.required_consecutive() {
                state.triggered = true;
                signals.push(RuleSignal::Trigger {
                    rule: rule.clone(),
                    value: sample.value,
                });
            } else {
                debug!(
                    "Rule '{}' holding ({}/{})",
                    rule.name,
                    state.consecutive,
                    rule.required_consecutive()
                );
            }
        }

        signals
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, RuleState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }
}
