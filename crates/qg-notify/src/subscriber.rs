use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use qg_common::{DeliveryOutcome, QueueMessage, NOTIFICATIONS_QUEUE};
use qg_queue::{MessageHandler, QueueProvider};
use tracing::{error, info, warn};

use crate::{NotificationDispatcher, NotificationEvent, NotifyError, Result};

/// Consumes the notifications queue and hands each event to the dispatcher.
pub struct NotificationSubscriber {
    gateway: Arc<dyn QueueProvider>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    started: AtomicBool,
}

impl NotificationSubscriber {
    pub fn new(gateway: Arc<dyn QueueProvider>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            gateway,
            dispatcher,
            started: AtomicBool::new(false),
        }
    }

    /// Create the notifications queue and subscribe to it. A second start
    /// while running is rejected.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NotifyError::DuplicateSubscription(NOTIFICATIONS_QUEUE.to_string()));
        }

        if let Err(e) = self.subscribe().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(queue = NOTIFICATIONS_QUEUE, "Notification subscriber started");
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        self.gateway.create_queue(NOTIFICATIONS_QUEUE).await?;
        let handler = Arc::new(DispatchHandler {
            dispatcher: self.dispatcher.clone(),
        });
        self.gateway
            .subscribe_to_queue(NOTIFICATIONS_QUEUE, handler)
            .await?;
        Ok(())
    }

    /// Tear the subscription down. Failures are logged, never returned.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        match self.gateway.unsubscribe_from_queue(NOTIFICATIONS_QUEUE).await {
            Ok(()) => info!(queue = NOTIFICATIONS_QUEUE, "Notification subscriber stopped"),
            Err(e) => error!(
                queue = NOTIFICATIONS_QUEUE,
                error = %e,
                "Failed to unsubscribe notification subscriber"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

struct DispatchHandler {
    dispatcher: Arc<dyn NotificationDispatcher>,
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, message: QueueMessage) -> DeliveryOutcome {
        let event = match NotificationEvent::from_message(&message) {
            Ok(event) => event,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Unreadable notification");
                return DeliveryOutcome::failed(e.to_string());
            }
        };

        match self.dispatcher.dispatch(event).await {
            Ok(()) => DeliveryOutcome::Processed,
            Err(e) => DeliveryOutcome::failed(e.to_string()),
        }
    }
}
