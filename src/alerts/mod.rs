/// Alert lifecycle: trigger, refresh, clear, acknowledge, resolve
pub mod alert_manager;

pub use alert_manager::{AlertManager, TriggerOutcome};
