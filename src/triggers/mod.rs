/// Rule engine deciding trigger/refresh/clear per evaluation tick
pub mod trigger_engine;
/// Threshold rule definitions
pub mod rules;

pub use rules::{AlertRule, Condition, RuleSet};
pub use trigger_engine::{RuleEngine, RuleSignal, MISS_LOG_INTERVAL};
