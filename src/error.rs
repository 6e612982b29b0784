use thiserror::Error;

/// Errors that can occur in data collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collection failed: {0}")]
    Failed(String),

    #[error("Collector '{collector}' timed out after {timeout_ms}ms")]
    Timeout { collector: String, timeout_ms: u64 },

    #[error("Sensor unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by the durable storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize stored data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur when delivering notifications
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Failed to deliver notification: {0}")]
    DeliveryFailed(String),

    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors returned synchronously by engine operations
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid alert transition: {0}")]
    InvalidTransition(String),

    #[error("Alert {0} not found")]
    AlertNotFound(u64),

    #[error("Alert rule {0} not found")]
    RuleNotFound(u64),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl MonitorError {
    /// Whether the error was caused by the caller's request rather than the engine
    pub fn is_client_error(&self) -> bool {
        !matches!(self, MonitorError::Persistence(_))
    }
}
