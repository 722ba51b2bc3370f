use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod logging;

/// Name of the queue the gateway uses for its own `message_published` events.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

/// Routing key that matches every queue without an exact entry.
pub const WILDCARD_ROUTE: &str = "*";

// ============================================================================
// Core Message Types
// ============================================================================

/// A message travelling through the gateway.
///
/// Messages are immutable: adapters build a fresh value when they translate a
/// backend-native delivery, and attach the backend's receipt handle at that
/// point. The receipt handle is only meaningful to the backend that issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Build a new outbound message with a freshly generated id.
    pub fn create(
        queue_name: impl Into<String>,
        payload: serde_json::Value,
        attributes: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            payload,
            attributes,
            receipt_handle: None,
            created_at: Utc::now(),
        }
    }

    /// Copy of this message carrying a backend receipt handle.
    pub fn with_receipt_handle(&self, receipt_handle: impl Into<String>) -> Self {
        Self {
            receipt_handle: Some(receipt_handle.into()),
            ..self.clone()
        }
    }
}

/// What a subscriber's handler reports back for a single delivery.
///
/// Adapters react differently to `Failed`:
/// - `redis` moves the job to the queue's failed set; it is not delivered again.
/// - `amqp` negatively acknowledges with requeue, so the broker redelivers it.
///   A handler that always fails will therefore see the message forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failed(reason.into())
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, DeliveryOutcome::Processed)
    }
}

// ============================================================================
// Backend Selection
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown backend type: {0}")]
pub struct UnknownBackendType(pub String);

/// The finite set of messaging backends the gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis-backed job queue
    Redis,
    /// AMQP broker (RabbitMQ)
    Amqp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Amqp => "amqp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue routing decision. `Both` is the composition of the two single
/// backends, in a fixed order: redis first, then amqp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
    Redis,
    Amqp,
    Both,
}

impl RoutePolicy {
    /// Backends targeted by this policy, in resolution order.
    pub fn backends(&self) -> &'static [BackendKind] {
        match self {
            RoutePolicy::Redis => &[BackendKind::Redis],
            RoutePolicy::Amqp => &[BackendKind::Amqp],
            RoutePolicy::Both => &[BackendKind::Redis, BackendKind::Amqp],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePolicy::Redis => "redis",
            RoutePolicy::Amqp => "amqp",
            RoutePolicy::Both => "both",
        }
    }
}

impl From<BackendKind> for RoutePolicy {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Redis => RoutePolicy::Redis,
            BackendKind::Amqp => RoutePolicy::Amqp,
        }
    }
}

impl FromStr for RoutePolicy {
    type Err = UnknownBackendType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(RoutePolicy::Redis),
            "amqp" => Ok(RoutePolicy::Amqp),
            "both" => Ok(RoutePolicy::Both),
            other => Err(UnknownBackendType(other.to_string())),
        }
    }
}

impl fmt::Display for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which gateway the process runs: a single adapter, or the composite router
/// over both adapters.
pub type ProviderMode = RoutePolicy;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Snapshot of gateway health, shaped for the request layer's health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub provider: String,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(provider: impl Into<String>, healthy: bool) -> Self {
        Self {
            status: if healthy { HealthStatus::Ok } else { HealthStatus::Degraded },
            provider: provider.into(),
            healthy,
            checked_at: Utc::now(),
        }
    }
}
