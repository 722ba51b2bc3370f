//! QueueGate Server
//!
//! Builds the queue gateway from configuration, connects it, and runs the
//! notification feedback loop until SIGINT/SIGTERM.
//!
//! ## Configuration
//!
//! Loaded from `$QUEUEGATE_CONFIG` or `config.toml`/`queuegate.toml`, then
//! overridden by `QUEUEGATE_*` environment variables. Run with
//! `--example-config` to print a documented sample.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use qg_config::{AppConfig, ConfigLoader};
use qg_notify::{LoggingDispatcher, NotificationSubscriber};
use qg_queue::amqp::AmqpBrokerConfig;
use qg_queue::gateway::{Gateway, GatewayConfig};
use qg_queue::redis::RedisJobQueueConfig;
use qg_queue::retry::RetryPolicy;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == "--example-config") {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    qg_common::logging::init_logging("qg-server");

    info!("Starting QueueGate");

    // 1. Configuration
    let config = ConfigLoader::new().load()?;

    // 2. Gateway
    let gateway = Gateway::new(gateway_config(&config))?;
    let provider = gateway.provider();
    provider.connect().await?;

    let health = gateway.health().await;
    info!(
        provider = %health.provider,
        status = ?health.status,
        "Queue gateway connected"
    );

    // 3. Notification feedback loop
    let subscriber = if config.notifications.enabled {
        let subscriber = NotificationSubscriber::new(provider.clone(), Arc::new(LoggingDispatcher));
        if let Err(e) = subscriber.start().await {
            error!(error = %e, "Failed to start notification subscriber");
        }
        Some(subscriber)
    } else {
        info!("Notifications disabled");
        None
    };

    info!("QueueGate running");
    shutdown_signal().await;
    info!("Shutdown signal received, stopping");

    if let Some(subscriber) = subscriber {
        subscriber.shutdown().await;
    }
    if let Err(e) = provider.disconnect().await {
        error!(error = %e, "Error while disconnecting gateway");
    }

    info!("QueueGate stopped");
    Ok(())
}

fn gateway_config(config: &AppConfig) -> GatewayConfig {
    // Only explicit routing is forwarded; the gateway applies its own default
    let routing = if config.queue_routing.is_some() {
        config.routing_table()
    } else {
        HashMap::new()
    };

    GatewayConfig {
        provider: config.queue_provider.clone(),
        routing,
        redis: RedisJobQueueConfig {
            url: config.redis.url(),
            prefix: config.redis.prefix.clone(),
            ..Default::default()
        },
        amqp: AmqpBrokerConfig {
            url: config.amqp.url.clone(),
            retry: RetryPolicy::linear(
                config.amqp.retry_attempts,
                Duration::from_millis(config.amqp.retry_delay_ms),
            ),
            ..Default::default()
        },
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
