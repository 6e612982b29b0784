use crate::error::NotificationError;
use crate::notify::content::NotificationContent;
use log::{error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Future returned by [`NotificationChannel::send`]
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotificationError>> + Send + 'a>>;

/// A delivery mechanism for alert notifications
pub trait NotificationChannel: Send + Sync {
    /// Name used in rule targets (`<name>` or `<name>:<recipient>`)
    fn name(&self) -> &str;

    /// Deliver one notification
    ///
    /// # Arguments
    ///
    /// * `recipient` - Channel-specific recipient; empty when the target named none
    /// * `content` - Rendered notification
    fn send<'a>(&'a self, recipient: &'a str, content: &'a NotificationContent) -> SendFuture<'a>;
}

/// Writes notifications to the log stream
#[derive(Debug, Default)]
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn send<'a>(&'a self, recipient: &'a str, content: &'a NotificationContent) -> SendFuture<'a> {
        Box::pin(async move {
            let to = if recipient.is_empty() { "-" } else { recipient };
            match content.severity {
                crate::model::Severity::Critical => {
                    error!("ALERT [to {}] {} | {}", to, content.title, content.body.replace('\n', " | "))
                }
                crate::model::Severity::Warning => {
                    warn!("ALERT [to {}] {} | {}", to, content.title, content.body.replace('\n', " | "))
                }
                crate::model::Severity::Info => {
                    info!("ALERT [to {}] {} | {}", to, content.title, content.body.replace('\n', " | "))
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: Option<&'a str>,
    alert_id: u64,
    rule_name: &'a str,
    severity: &'a str,
    escalation_level: u32,
    title: &'a str,
    body: &'a str,
}

/// POSTs a JSON payload to a fixed URL
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    /// Create a webhook channel
    ///
    /// # Errors
    ///
    /// `NotificationError::Http` if the HTTP client cannot be built
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send<'a>(&'a self, recipient: &'a str, content: &'a NotificationContent) -> SendFuture<'a> {
        Box::pin(async move {
            let payload = WebhookPayload {
                recipient: (!recipient.is_empty()).then_some(recipient),
                alert_id: content.alert_id,
                rule_name: &content.rule_name,
                severity: content.severity.as_str(),
                escalation_level: content.escalation_level,
                title: &content.title,
                body: &content.body,
            };

            let response = self.client.post(&self.url).json(&payload).send().await?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(NotificationError::DeliveryFailed(format!(
                    "webhook returned {}: {}",
                    status, text
                )));
            }

            Ok(())
        })
    }
}

/// A delivery recorded by [`MockChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct MockDelivery {
    pub recipient: String,
    pub content: NotificationContent,
}

/// Scriptable channel for tests and dry runs
///
/// Fails the first `failures` attempts (or every attempt when `always_fail`
/// is set), then records each successful delivery.
pub struct MockChannel {
    name: String,
    failures: Arc<Mutex<usize>>,
    always_fail: bool,
    delay: Option<Duration>,
    call_count: Arc<Mutex<usize>>,
    deliveries: Arc<Mutex<Vec<MockDelivery>>>,
}

impl MockChannel {
    /// A channel that accepts every notification
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures: Arc::new(Mutex::new(0)),
            always_fail: false,
            delay: None,
            call_count: Arc::new(Mutex::new(0)),
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A channel whose first `failures` attempts fail
    pub fn failing_first(name: impl Into<String>, failures: usize) -> Self {
        let channel = Self::succeeding(name);
        *channel.failures.lock().unwrap_or_else(|p| p.into_inner()) = failures;
        channel
    }

    /// A channel that rejects every notification
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self {
            always_fail: true,
            ..Self::succeeding(name)
        }
    }

    /// Delay every attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `send` calls, failed ones included
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Successful deliveries in order
    pub fn deliveries(&self) -> Vec<MockDelivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl NotificationChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, recipient: &'a str, content: &'a NotificationContent) -> SendFuture<'a> {
        Box::pin(async move {
            *self.call_count.lock().unwrap_or_else(|p| p.into_inner()) += 1;

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.always_fail {
                return Err(NotificationError::DeliveryFailed(format!(
                    "{} is configured to fail",
                    self.name
                )));
            }

            {
                let mut remaining = self.failures.lock().unwrap_or_else(|p| p.into_inner());
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(NotificationError::DeliveryFailed(format!(
                        "{} scripted failure",
                        self.name
                    )));
                }
            }

            self.deliveries
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(MockDelivery {
                    recipient: recipient.to_string(),
                    content: content.clone(),
                });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    fn content() -> NotificationContent {
        NotificationContent {
            alert_id: 1,
            rule_name: "High CPU".to_string(),
            severity: Severity::Critical,
            escalation_level: 0,
            title: "[CRITICAL] High CPU".to_string(),
            body: "Rule: High CPU".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_channel_always_succeeds() {
        let channel = LogChannel;
        assert_eq!(channel.name(), "log");
        assert!(channel.send("", &content()).await.is_ok());
        assert!(channel.send("ops", &content()).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_channel_records_deliveries() {
        let channel = MockChannel::succeeding("mock");
        channel.send("ops", &content()).await.unwrap();

        assert_eq!(channel.call_count(), 1);
        let deliveries = channel.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].recipient, "ops");
        assert_eq!(deliveries[0].content.alert_id, 1);
    }

    #[tokio::test]
    async fn test_mock_channel_scripted_failures() {
        let channel = MockChannel::failing_first("flaky", 2);
        assert!(channel.send("", &content()).await.is_err());
        assert!(channel.send("", &content()).await.is_err());
        assert!(channel.send("", &content()).await.is_ok());
        assert_eq!(channel.call_count(), 3);
        assert_eq!(channel.deliveries().len(), 1);

        let broken = MockChannel::always_failing("broken");
        for _ in 0..3 {
            assert!(matches!(
                broken.send("", &content()).await,
                Err(NotificationError::DeliveryFailed(_))
            ));
        }
        assert!(broken.deliveries().is_empty());
    }

    #[test]
    fn test_webhook_channel_creation() {
        let channel = WebhookChannel::new("http://localhost:9/hook", Duration::from_secs(1)).unwrap();
        assert_eq!(channel.name(), "webhook");
        assert_eq!(channel.url(), "http://localhost:9/hook");
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_http_error() {
        // Port 9 (discard) is not expected to accept HTTP connections
        let channel =
            WebhookChannel::new("http://127.0.0.1:9/hook", Duration::from_millis(500)).unwrap();
        let result = channel.send("ops", &content()).await;
        assert!(matches!(result, Err(NotificationError::Http(_))));
    }

    #[test]
    fn test_webhook_payload_serialization() {
        let c = content();
        let payload = WebhookPayload {
            recipient: None,
            alert_id: c.alert_id,
            rule_name: &c.rule_name,
            severity: c.severity.as_str(),
            escalation_level: 0,
            title: &c.title,
            body: &c.body,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["severity"], "critical");
        assert!(json["recipient"].is_null());
    }
}
