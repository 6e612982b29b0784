use crate::model::{Alert, Severity};
use serde::{Deserialize, Serialize};

/// Maximum title length in bytes
pub const MAX_TITLE_LEN: usize = 256;
/// Maximum body length in bytes
pub const MAX_BODY_LEN: usize = 1024;

/// Rendered notification for one alert event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationContent {
    pub alert_id: u64,
    pub rule_name: String,
    pub severity: Severity,
    pub escalation_level: u32,
    pub title: String,
    pub body: String,
}

impl NotificationContent {
    /// Build the title and body for a newly fired or escalated alert
    pub fn for_alert(alert: &Alert) -> Self {
        let title = if alert.escalation_level > 0 {
            format!(
                "[{}] {} (escalated to level {})",
                alert.severity.as_str().to_uppercase(),
                alert.rule_name,
                alert.escalation_level
            )
        } else {
            format!(
                "[{}] {}",
                alert.severity.as_str().to_uppercase(),
                alert.rule_name
            )
        };

        Self {
            alert_id: alert.id,
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            escalation_level: alert.escalation_level,
            title: truncate_text(&title, MAX_TITLE_LEN),
            body: truncate_text(&format_body(alert), MAX_BODY_LEN),
        }
    }

    /// Title and body as stored on the notification record
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.title, self.body)
    }
}

fn format_body(alert: &Alert) -> String {
    let mut body = format!(
        "Rule: {}\nMetric: {} = {:.2} (threshold {} {:.2})\nSeverity: {}\n",
        alert.rule_name,
        alert.metric_name,
        alert.value,
        alert.condition,
        alert.threshold,
        alert.severity.as_str()
    );
    if alert.escalation_level > 0 {
        body.push_str(&format!("Escalation level: {}\n", alert.escalation_level));
    }
    body.push_str(&format!(
        "Fired at: {}\n\n{}",
        alert.fired_at.to_rfc3339(),
        alert.message
    ));
    body.trim().to_string()
}

/// Truncate `text` to at most `max_length` bytes, ending in "..."
///
/// Cuts only on UTF-8 character boundaries.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let mut cut = max_length.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}
