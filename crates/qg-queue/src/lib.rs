//! QueueGate queue providers
//!
//! One producer/consumer contract ([`QueueProvider`]) over two backends:
//! - [`crate::redis::RedisJobQueue`]: pull-based job queue stored in Redis
//! - [`crate::amqp::AmqpBroker`]: AMQP broker with manual acknowledgment
//!
//! [`router::CompositeRouter`] implements the same contract on top of both and
//! routes each queue to one backend or fans out to both.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use qg_common::{DeliveryOutcome, QueueMessage};

pub mod error;
pub mod retry;
pub mod router;
pub mod routing;
mod subscription;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(all(feature = "redis", feature = "amqp"))]
pub mod gateway;

pub use error::QueueError;
pub use router::{CompositeRouter, FanOutReport};
pub use routing::RoutingTable;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Callback invoked once per message delivered to a subscription.
///
/// Returning [`DeliveryOutcome::Failed`] never tears the subscription down; see
/// [`DeliveryOutcome`] for how each backend treats a failed delivery. A panic
/// inside the handler is caught and treated as a failure.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> DeliveryOutcome;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryOutcome> + Send + 'static,
{
    async fn handle(&self, message: QueueMessage) -> DeliveryOutcome {
        (self.0)(message).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryOutcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Run a handler, converting a panic into `DeliveryOutcome::Failed`.
pub(crate) async fn invoke_isolated(
    handler: &dyn MessageHandler,
    message: QueueMessage,
) -> DeliveryOutcome {
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            DeliveryOutcome::Failed(format!("handler panicked: {}", reason))
        }
    }
}

/// The operation set shared by every backend adapter and the router.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Short provider name for health reporting ("redis", "amqp", "composite")
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Stop all subscriptions and release connections.
    async fn disconnect(&self) -> Result<()>;

    /// Publish a message; returns the backend's id for it.
    async fn publish(&self, message: &QueueMessage) -> Result<String>;

    /// Fetch up to `max_messages` messages without blocking for more.
    /// Every returned message carries a receipt handle.
    async fn receive(&self, queue_name: &str, max_messages: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a received message. Unknown handles are a no-op.
    async fn acknowledge(&self, queue_name: &str, receipt_handle: &str) -> Result<()>;

    async fn create_queue(&self, queue_name: &str) -> Result<String>;

    async fn delete_queue(&self, queue_name: &str) -> Result<()>;

    async fn health_check(&self) -> bool;

    /// Start delivering messages of `queue_name` to `handler`. At most one
    /// subscription per queue: a second call fails with `DuplicateSubscription`.
    async fn subscribe_to_queue(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Stop the subscription on `queue_name`; `MissingSubscription` if none.
    async fn unsubscribe_from_queue(&self, queue_name: &str) -> Result<()>;
}
