//! Gateway construction from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use qg_common::{BackendKind, HealthReport, ProviderMode, RoutePolicy};
use tracing::{info, warn};

use crate::amqp::{AmqpBroker, AmqpBrokerConfig};
use crate::redis::{RedisJobQueue, RedisJobQueueConfig};
use crate::{CompositeRouter, QueueProvider, Result, RoutingTable};

/// Everything needed to build a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// "redis", "amqp" or "both"; anything else is rejected
    pub provider: String,
    /// Only consulted in "both" mode
    pub routing: HashMap<String, RoutePolicy>,
    pub redis: RedisJobQueueConfig,
    pub amqp: AmqpBrokerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: "redis".to_string(),
            routing: HashMap::new(),
            redis: RedisJobQueueConfig::default(),
            amqp: AmqpBrokerConfig::default(),
        }
    }
}

/// The provider the rest of the process talks to.
pub enum Gateway {
    Redis(Arc<RedisJobQueue>),
    Amqp(Arc<AmqpBroker>),
    Composite(Arc<CompositeRouter>),
}

impl Gateway {
    /// Build the gateway for `config.provider`. Nothing is connected yet.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let mode: ProviderMode = config.provider.parse()?;

        if mode != RoutePolicy::Both && !config.routing.is_empty() {
            warn!(
                provider = %mode,
                "Queue routing is only used with the 'both' provider; ignoring it"
            );
        }

        let gateway = match mode {
            RoutePolicy::Redis => Self::Redis(Arc::new(RedisJobQueue::new(config.redis)?)),
            RoutePolicy::Amqp => Self::Amqp(Arc::new(AmqpBroker::new(config.amqp))),
            RoutePolicy::Both => {
                let routing = if config.routing.is_empty() {
                    RoutingTable::default()
                } else {
                    RoutingTable::new(config.routing)
                };
                let referenced = routing.referenced_backends();
                for kind in [BackendKind::Redis, BackendKind::Amqp] {
                    if !referenced.contains(&kind) {
                        info!(backend = %kind, "Backend is connected but no queue routes to it");
                    }
                }

                let redis: Arc<dyn QueueProvider> = Arc::new(RedisJobQueue::new(config.redis)?);
                let amqp: Arc<dyn QueueProvider> = Arc::new(AmqpBroker::new(config.amqp));
                Self::Composite(Arc::new(CompositeRouter::new(redis, amqp, routing)))
            }
        };

        info!(provider = %gateway.mode(), "Queue gateway built");
        Ok(gateway)
    }

    pub fn mode(&self) -> ProviderMode {
        match self {
            Self::Redis(_) => RoutePolicy::Redis,
            Self::Amqp(_) => RoutePolicy::Amqp,
            Self::Composite(_) => RoutePolicy::Both,
        }
    }

    pub fn provider(&self) -> Arc<dyn QueueProvider> {
        match self {
            Self::Redis(p) => p.clone(),
            Self::Amqp(p) => p.clone(),
            Self::Composite(p) => p.clone(),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let provider = self.provider();
        HealthReport::new(provider.name(), provider.health_check().await)
    }
}
