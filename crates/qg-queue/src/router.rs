//! Composite Router
//!
//! Presents the [`QueueProvider`] contract over one redis adapter and one amqp
//! adapter. Every queue-scoped operation first resolves the queue through the
//! [`RoutingTable`]; operations on a `both` queue fan out to the two adapters
//! concurrently and wait for both to settle. Nothing is cancelled or rolled
//! back when one side fails, so a fan-out may leave the backends diverged.
//! [`FanOutReport`] makes such partial outcomes observable.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use qg_common::{BackendKind, DeliveryOutcome, QueueMessage};
use tracing::{debug, error, info, warn};

use crate::routing::RoutingTable;
use crate::{invoke_isolated, MessageHandler, QueueError, QueueProvider, Result};

const ALL_BACKENDS: &[BackendKind] = &[BackendKind::Redis, BackendKind::Amqp];

/// Per-backend results of one fan-out call, in resolution order.
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub outcomes: Vec<(BackendKind, Result<T>)>,
}

impl<T> FanOutReport<T> {
    pub fn succeeded(&self) -> Vec<BackendKind> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn failed(&self) -> Vec<(BackendKind, &QueueError)> {
        self.outcomes
            .iter()
            .filter_map(|(kind, r)| r.as_ref().err().map(|e| (*kind, e)))
            .collect()
    }

    /// At least one backend succeeded and at least one failed.
    pub fn is_partial(&self) -> bool {
        let failures = self.outcomes.iter().filter(|(_, r)| r.is_err()).count();
        failures > 0 && failures < self.outcomes.len()
    }

    /// Collapse to a single result: the first failure in resolution order, or
    /// else the first backend's value.
    pub fn into_result(self, operation: &str, target: &str) -> Result<T> {
        if self.is_partial() {
            let succeeded = self.succeeded();
            for (backend, e) in self.failed() {
                warn!(
                    operation,
                    target,
                    backend = %backend,
                    succeeded = ?succeeded,
                    error = %e,
                    "Fan-out partially failed; backends may have diverged"
                );
            }
        }

        let mut first_ok = None;
        for (_, result) in self.outcomes {
            match result {
                Err(e) => return Err(e),
                Ok(value) if first_ok.is_none() => first_ok = Some(value),
                Ok(_) => {}
            }
        }
        first_ok.ok_or_else(|| QueueError::NoBackendForQueue(target.to_string()))
    }
}

/// Handler wrapper installed per backend. Failures are logged with the
/// backend that saw them, then passed through so the adapter applies its own
/// failure behavior.
struct IsolatedHandler {
    backend: BackendKind,
    queue: String,
    inner: Arc<dyn MessageHandler>,
}

#[async_trait]
impl MessageHandler for IsolatedHandler {
    async fn handle(&self, message: QueueMessage) -> DeliveryOutcome {
        let message_id = message.id.clone();
        let outcome = invoke_isolated(self.inner.as_ref(), message).await;

        if let DeliveryOutcome::Failed(reason) = &outcome {
            let failure = QueueError::DeliveryHandler {
                backend: self.backend,
                queue: self.queue.clone(),
                reason: reason.clone(),
            };
            warn!(message_id = %message_id, error = %failure, "Subscriber handler failed");
        }
        outcome
    }
}

pub struct CompositeRouter {
    redis: Arc<dyn QueueProvider>,
    amqp: Arc<dyn QueueProvider>,
    routing: RoutingTable,
    /// Backends the router has subscribed per queue
    subscriptions: Mutex<HashMap<String, HashSet<BackendKind>>>,
}

impl CompositeRouter {
    pub fn new(
        redis: Arc<dyn QueueProvider>,
        amqp: Arc<dyn QueueProvider>,
        routing: RoutingTable,
    ) -> Self {
        Self {
            redis,
            amqp,
            routing,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    fn backend(&self, kind: BackendKind) -> &dyn QueueProvider {
        match kind {
            BackendKind::Redis => self.redis.as_ref(),
            BackendKind::Amqp => self.amqp.as_ref(),
        }
    }

    /// Issue `op` to every backend in `backends` concurrently and wait for all.
    async fn fan_out<'a, T, F, Fut>(&'a self, backends: &[BackendKind], op: F) -> FanOutReport<T>
    where
        F: Fn(BackendKind, &'a dyn QueueProvider) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let calls = backends.iter().map(|&kind| {
            let call = op(kind, self.backend(kind));
            async move { (kind, call.await) }
        });
        FanOutReport {
            outcomes: join_all(calls).await,
        }
    }

    /// Publish and return every backend's outcome instead of the collapsed
    /// result. Fails only when the queue resolves to no backend.
    pub async fn publish_with_report(&self, message: &QueueMessage) -> Result<FanOutReport<String>> {
        let backends = self.routing.backends_for(&message.queue_name)?;
        Ok(self.fan_out(backends, |_, p| p.publish(message)).await)
    }

    /// Backends currently subscribed through this router for `queue_name`,
    /// in resolution order.
    pub fn subscribed_backends(&self, queue_name: &str) -> Vec<BackendKind> {
        let subscriptions = self.subscriptions.lock();
        match subscriptions.get(queue_name) {
            Some(kinds) => ALL_BACKENDS
                .iter()
                .copied()
                .filter(|k| kinds.contains(k))
                .collect(),
            None => Vec::new(),
        }
    }

    fn forget_subscriptions(&self, queue_name: &str, kinds: &[BackendKind]) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(set) = subscriptions.get_mut(queue_name) {
            for kind in kinds {
                set.remove(kind);
            }
            if set.is_empty() {
                subscriptions.remove(queue_name);
            }
        }
    }
}

async fn isolated_health(kind: BackendKind, provider: &dyn QueueProvider) -> bool {
    match AssertUnwindSafe(provider.health_check()).catch_unwind().await {
        Ok(healthy) => healthy,
        Err(_) => {
            error!(backend = %kind, "Health check panicked");
            false
        }
    }
}

#[async_trait]
impl QueueProvider for CompositeRouter {
    fn name(&self) -> &str {
        "composite"
    }

    async fn connect(&self) -> Result<()> {
        self.fan_out(ALL_BACKENDS, |_, p| p.connect())
            .await
            .into_result("connect", "all backends")?;
        info!("Composite router connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let report = self.fan_out(ALL_BACKENDS, |_, p| p.disconnect()).await;
        self.subscriptions.lock().clear();
        report.into_result("disconnect", "all backends")?;
        info!("Composite router disconnected");
        Ok(())
    }

    async fn publish(&self, message: &QueueMessage) -> Result<String> {
        self.publish_with_report(message)
            .await?
            .into_result("publish", &message.queue_name)
    }

    async fn receive(&self, queue_name: &str, max_messages: usize) -> Result<Vec<QueueMessage>> {
        // Only the first resolved backend is read
        let backends = self.routing.backends_for(queue_name)?;
        self.backend(backends[0]).receive(queue_name, max_messages).await
    }

    async fn acknowledge(&self, queue_name: &str, receipt_handle: &str) -> Result<()> {
        let backends = self.routing.backends_for(queue_name)?;
        self.fan_out(backends, |_, p| p.acknowledge(queue_name, receipt_handle))
            .await
            .into_result("acknowledge", queue_name)
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String> {
        let backends = self.routing.backends_for(queue_name)?;
        self.fan_out(backends, |_, p| p.create_queue(queue_name))
            .await
            .into_result("create_queue", queue_name)
    }

    async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let backends = self.routing.backends_for(queue_name)?;
        self.fan_out(backends, |_, p| p.delete_queue(queue_name))
            .await
            .into_result("delete_queue", queue_name)
    }

    async fn health_check(&self) -> bool {
        let (redis, amqp) = futures::join!(
            isolated_health(BackendKind::Redis, self.redis.as_ref()),
            isolated_health(BackendKind::Amqp, self.amqp.as_ref()),
        );
        if !(redis && amqp) {
            warn!(redis, amqp, "Composite health check failed");
        }
        redis && amqp
    }

    async fn subscribe_to_queue(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let backends = self.routing.backends_for(queue_name)?;

        // Claim the backends before awaiting so concurrent calls never
        // subscribe the same backend twice
        let pending: Vec<BackendKind> = {
            let mut subscriptions = self.subscriptions.lock();
            let subscribed = subscriptions.entry(queue_name.to_string()).or_default();
            backends
                .iter()
                .copied()
                .filter(|kind| subscribed.insert(*kind))
                .collect()
        };

        if pending.is_empty() {
            debug!(queue = %queue_name, "Already subscribed on every routed backend");
            return Ok(());
        }

        let report = self
            .fan_out(&pending, |kind, p| {
                let isolated: Arc<dyn MessageHandler> = Arc::new(IsolatedHandler {
                    backend: kind,
                    queue: queue_name.to_string(),
                    inner: handler.clone(),
                });
                p.subscribe_to_queue(queue_name, isolated)
            })
            .await;

        let failed: Vec<BackendKind> = report.failed().into_iter().map(|(kind, _)| kind).collect();
        self.forget_subscriptions(queue_name, &failed);

        let subscribed = report.succeeded();
        report.into_result("subscribe", queue_name)?;
        info!(queue = %queue_name, backends = ?subscribed, "Subscribed through composite router");
        Ok(())
    }

    async fn unsubscribe_from_queue(&self, queue_name: &str) -> Result<()> {
        let backends = self.routing.backends_for(queue_name)?;
        self.subscriptions.lock().remove(queue_name);

        self.fan_out(backends, |_, p| p.unsubscribe_from_queue(queue_name))
            .await
            .into_result("unsubscribe", queue_name)?;
        info!(queue = %queue_name, "Unsubscribed through composite router");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<(BackendKind, Result<&'static str>)>) -> FanOutReport<&'static str> {
        FanOutReport { outcomes }
    }

    #[test]
    fn test_all_succeeded_returns_first_value() {
        let r = report(vec![(BackendKind::Redis, Ok("a")), (BackendKind::Amqp, Ok("b"))]);
        assert!(!r.is_partial());
        assert_eq!(r.into_result("publish", "orders").unwrap(), "a");
    }

    #[test]
    fn test_partial_failure_is_observable() {
        let r = report(vec![
            (BackendKind::Redis, Ok("a")),
            (BackendKind::Amqp, Err(QueueError::Amqp("channel closed".into()))),
        ]);

        assert!(r.is_partial());
        assert_eq!(r.succeeded(), vec![BackendKind::Redis]);
        assert_eq!(r.failed().len(), 1);
        assert_eq!(r.failed()[0].0, BackendKind::Amqp);
        assert!(matches!(r.into_result("publish", "orders"), Err(QueueError::Amqp(_))));
    }

    #[test]
    fn test_first_failure_in_resolution_order_wins() {
        let r = report(vec![
            (BackendKind::Redis, Err(QueueError::Redis("down".into()))),
            (BackendKind::Amqp, Err(QueueError::Amqp("down".into()))),
        ]);
        assert!(!r.is_partial());
        assert!(matches!(r.into_result("publish", "orders"), Err(QueueError::Redis(_))));
    }

    #[tokio::test]
    async fn test_isolated_handler_passes_failure_through() {
        let handler = IsolatedHandler {
            backend: BackendKind::Amqp,
            queue: "orders".to_string(),
            inner: crate::handler_fn(|_| async { DeliveryOutcome::failed("nope") }),
        };
        let message = QueueMessage::create("orders", serde_json::json!({}), None);
        assert_eq!(handler.handle(message).await, DeliveryOutcome::failed("nope"));
    }
}
