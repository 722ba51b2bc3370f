//! QueueGate notification feedback loop
//!
//! Every successful publish is announced with a `message_published` event on
//! the reserved `notifications` queue. The subscriber consumes that queue
//! through the same gateway and hands each event to a
//! [`NotificationDispatcher`].

use thiserror::Error;

mod dispatcher;
mod event;
mod publisher;
mod service;
mod subscriber;

pub use dispatcher::{LoggingDispatcher, NotificationDispatcher};
pub use event::{NotificationEvent, MESSAGE_PUBLISHED};
pub use publisher::NotificationPublisher;
pub use service::PublishService;
pub use subscriber::NotificationSubscriber;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Queue error: {0}")]
    Queue(#[from] qg_queue::QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue '{0}' is already subscribed")]
    DuplicateSubscription(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
