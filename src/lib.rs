/// Error types for the monitoring engine
pub mod error;

/// Metric, alert and notification data types
pub mod model;

/// Configuration management
pub mod config;

/// Pluggable metric collectors
pub mod collectors;

/// Latest-value cache and durable storage
pub mod store;

/// Threshold rules and their evaluation
pub mod triggers;

/// Alert lifecycle management
pub mod alerts;

/// Notification channels and dispatch
pub mod notify;

/// Engine self-monitoring counters
pub mod monitoring;

/// Aggregated reports over stored history
pub mod report;

/// Periodic loops driving the engine
pub mod scheduler;

/// The engine and its builder
pub mod engine;

// Re-export commonly used types
pub use config::Config;
pub use engine::{CleanupSummary, EngineBuilder, MonitoringEngine};
pub use error::{CollectorError, ConfigError, MonitorError, NotificationError, StoreError};
pub use model::{
    Alert, AlertStatus, Labels, MetricKind, MetricRecord, MetricSample, NotificationRecord,
    NotificationStatus, Severity,
};
pub use triggers::{AlertRule, Condition};
