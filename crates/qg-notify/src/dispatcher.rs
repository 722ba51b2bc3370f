use async_trait::async_trait;
use tracing::info;

use crate::{NotificationEvent, Result};

/// Entry point of the command layer for delivered notifications.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: NotificationEvent) -> Result<()>;
}

/// Default dispatcher: logs each notification.
pub struct LoggingDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingDispatcher {
    async fn dispatch(&self, event: NotificationEvent) -> Result<()> {
        info!(
            queue = %event.queue,
            message_id = %event.message_id,
            timestamp = %event.timestamp,
            "Message published"
        );
        Ok(())
    }
}
