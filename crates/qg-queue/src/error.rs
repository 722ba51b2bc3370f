use qg_common::{BackendKind, UnknownBackendType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The backend stayed unreachable for every configured attempt.
    #[error("Failed to connect to {backend} after {attempts} attempts: {reason}")]
    Connection {
        backend: BackendKind,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    UnknownBackendType(#[from] UnknownBackendType),

    #[error("Queue '{queue}' is already subscribed on {backend}")]
    DuplicateSubscription { queue: String, backend: BackendKind },

    #[error("Queue '{queue}' has no subscription on {backend}")]
    MissingSubscription { queue: String, backend: BackendKind },

    #[error("No backend configured for queue: {0}")]
    NoBackendForQueue(String),

    #[error("Delivery handler failed on {backend} for queue '{queue}': {reason}")]
    DeliveryHandler {
        backend: BackendKind,
        queue: String,
        reason: String,
    },

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Redis(e.to_string())
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Amqp(e.to_string())
    }
}
