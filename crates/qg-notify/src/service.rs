use std::collections::HashMap;
use std::sync::Arc;

use qg_common::{QueueMessage, NOTIFICATIONS_QUEUE};
use qg_queue::QueueProvider;
use tracing::{debug, warn};

use crate::{NotificationPublisher, Result};

/// Caller-facing publish: build the message, publish it through the gateway,
/// then announce it on the notifications queue.
pub struct PublishService {
    gateway: Arc<dyn QueueProvider>,
    notifier: Option<NotificationPublisher>,
}

impl PublishService {
    pub fn new(gateway: Arc<dyn QueueProvider>, notifications_enabled: bool) -> Self {
        let notifier = notifications_enabled.then(|| NotificationPublisher::new(gateway.clone()));
        Self { gateway, notifier }
    }

    pub fn gateway(&self) -> &Arc<dyn QueueProvider> {
        &self.gateway
    }

    /// Publish `payload` to `queue`; returns the backend id. A notification
    /// failure is logged and does not fail the publish.
    pub async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        attributes: Option<HashMap<String, String>>,
    ) -> Result<String> {
        let message = QueueMessage::create(queue, payload, attributes);
        let id = self.gateway.publish(&message).await?;
        debug!(queue = %queue, message_id = %id, "Message published");

        // Notifying about notifications would loop forever
        if queue == NOTIFICATIONS_QUEUE {
            return Ok(id);
        }

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.message_published(queue, &id).await {
                warn!(queue = %queue, message_id = %id, error = %e, "Failed to publish notification");
            }
        }
        Ok(id)
    }
}
