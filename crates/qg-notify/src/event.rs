use chrono::{DateTime, Utc};
use qg_common::{QueueMessage, NOTIFICATIONS_QUEUE};
use serde::{Deserialize, Serialize};

use crate::Result;

pub const MESSAGE_PUBLISHED: &str = "message_published";

/// Payload published to the notifications queue after a successful publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Queue the original message was published to
    pub queue: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn message_published(queue: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            event_type: MESSAGE_PUBLISHED.to_string(),
            queue: queue.into(),
            message_id: message_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wrap the event in a message addressed to the notifications queue.
    pub fn to_message(&self) -> Result<QueueMessage> {
        Ok(QueueMessage::create(
            NOTIFICATIONS_QUEUE,
            serde_json::to_value(self)?,
            None,
        ))
    }

    pub fn from_message(message: &QueueMessage) -> Result<Self> {
        Ok(serde_json::from_value(message.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = NotificationEvent::message_published("orders", "abc-123");
        let message = event.to_message().unwrap();

        assert_eq!(message.queue_name, NOTIFICATIONS_QUEUE);
        assert_eq!(message.payload["type"], "message_published");
        assert_eq!(message.payload["queue"], "orders");
        assert_eq!(message.payload["messageId"], "abc-123");
        assert!(message.payload["timestamp"].is_string());

        assert_eq!(NotificationEvent::from_message(&message).unwrap(), event);
    }

    #[test]
    fn test_foreign_payload_is_rejected() {
        let message = QueueMessage::create(NOTIFICATIONS_QUEUE, serde_json::json!({"x": 1}), None);
        assert!(NotificationEvent::from_message(&message).is_err());
    }
}
