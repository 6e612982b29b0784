/// Notification channels: log, webhook and a scriptable mock
pub mod channels;

/// Notification title/body rendering
pub mod content;

/// Background delivery with retries
pub mod dispatcher;

pub use channels::{LogChannel, MockChannel, MockDelivery, NotificationChannel, WebhookChannel};
pub use content::NotificationContent;
pub use dispatcher::{ChannelTarget, NotificationDispatcher, RetryPolicy};
