//! Alert entities and the value types that describe the push channel.
//!
//! An [`Alert`] is a pending customer message mirrored from the remote store.
//! The engine never invents alerts; it only applies what the bootstrap read,
//! the change feed, or a polling refresh hands it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to a truncated notification preview.
const PREVIEW_ELLIPSIS: char = '…';

/// Stable remote key of the operator a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A pending customer message awaiting operator acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub customer_name: String,
    pub phone: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub subject_id: SubjectId,
}

impl Alert {
    /// Build an unread alert stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        subject_id: SubjectId,
        customer_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            customer_name: customer_name.into(),
            phone: String::new(),
            message: message.into(),
            order_id: None,
            is_read: false,
            created_at: now,
            updated_at: now,
            subject_id,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn read(mut self) -> Self {
        self.is_read = true;
        self
    }

    /// First `max_chars` characters of the message, with an ellipsis when cut.
    ///
    /// Counts `char`s rather than bytes so multi-byte text never splits.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.message.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            let mut truncated = head;
            truncated.push(PREVIEW_ELLIPSIS);
            truncated
        } else {
            head
        }
    }
}

/// One change pushed by the feed, already decoded into a tagged variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Insert(Alert),
    Update(Alert),
    Delete { id: String },
}

impl AlertEvent {
    /// Id of the alert this event touches.
    pub fn alert_id(&self) -> &str {
        match self {
            Self::Insert(alert) | Self::Update(alert) => &alert.id,
            Self::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Status callbacks reported by a change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Handshake completed; events will flow.
    Subscribed,
    /// The channel failed, before or after subscribing.
    ChannelError(String),
    /// The provider gave up waiting for the handshake.
    TimedOut,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Subscribed)
    }
}

/// Which transport is currently keeping the store fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No subscription and no fallback (before bootstrap or after teardown).
    #[default]
    Closed,
    /// A subscription handshake is pending or a retry is scheduled.
    Connecting,
    /// The push subscription is live.
    Subscribed,
    /// The circuit is open and polling is live.
    Degraded,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_with_message(message: &str) -> Alert {
        Alert::new("a1", SubjectId::new("s1"), "Maria", message)
    }

    #[test]
    fn preview_keeps_short_messages_intact() {
        let alert = alert_with_message("Mesa 4 pediu a conta");
        assert_eq!(alert.preview(50), "Mesa 4 pediu a conta");
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        let alert = alert_with_message("ção".repeat(30).as_str());
        let preview = alert.preview(50);
        assert_eq!(preview.chars().count(), 51);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn preview_of_exact_length_has_no_ellipsis() {
        let alert = alert_with_message(&"x".repeat(50));
        assert_eq!(alert.preview(50), "x".repeat(50));
    }

    #[test]
    fn alert_json_uses_snake_case_fields() {
        let alert = alert_with_message("oi").with_order("o-9");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["subject_id"], "s1");
        assert_eq!(json["order_id"], "o-9");
        assert_eq!(json["is_read"], false);

        let back: Alert = serde_json::from_value(json).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = serde_json::json!({
            "id": "a2",
            "customer_name": "João",
            "phone": "+55 11 99999-0000",
            "message": "Cadê meu pedido?",
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z",
            "subject_id": "s1"
        });
        let alert: Alert = serde_json::from_value(json).unwrap();
        assert!(!alert.is_read);
        assert!(alert.order_id.is_none());
    }

    #[test]
    fn event_reports_its_alert_id() {
        let alert = alert_with_message("oi");
        assert_eq!(AlertEvent::Insert(alert.clone()).alert_id(), "a1");
        assert_eq!(AlertEvent::Delete { id: "a9".into() }.alert_id(), "a9");
        assert_eq!(AlertEvent::Update(alert).kind(), "update");
    }

    #[test]
    fn only_subscribed_is_not_a_failure() {
        assert!(!ChannelStatus::Subscribed.is_failure());
        assert!(ChannelStatus::TimedOut.is_failure());
        assert!(ChannelStatus::ChannelError("closed".into()).is_failure());
    }
}
