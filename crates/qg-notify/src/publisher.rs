use std::sync::Arc;

use qg_queue::QueueProvider;
use tracing::debug;

use crate::{NotificationEvent, Result};

/// Publishes `message_published` events to the notifications queue.
pub struct NotificationPublisher {
    gateway: Arc<dyn QueueProvider>,
}

impl NotificationPublisher {
    pub fn new(gateway: Arc<dyn QueueProvider>) -> Self {
        Self { gateway }
    }

    /// Announce that `message_id` was published to `queue`. Returns the id of
    /// the notification message.
    pub async fn message_published(&self, queue: &str, message_id: &str) -> Result<String> {
        let message = NotificationEvent::message_published(queue, message_id).to_message()?;
        let id = self.gateway.publish(&message).await?;
        debug!(queue = %queue, message_id = %message_id, notification_id = %id, "Notification published");
        Ok(id)
    }
}
