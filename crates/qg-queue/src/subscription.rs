//! Per-adapter subscription bookkeeping.
//!
//! Each adapter owns one [`SubscriptionRegistry`]. A [`Subscription`] owns the
//! task that drives its consumer; dropping it (including when the adapter is
//! dropped) aborts the task, so no consumer outlives its adapter.
//!
//! Claims are per queue: a subscribe that is still connecting only holds the
//! entry for its own queue name.

use std::sync::Arc;

use dashmap::DashMap;
use qg_common::BackendKind;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{QueueError, Result};

pub(crate) struct Subscription {
    pub queue_name: String,
    /// Backend-side consumer identity (AMQP consumer tag, worker id for Redis)
    pub consumer_tag: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        queue_name: impl Into<String>,
        consumer_tag: impl Into<String>,
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            consumer_tag: consumer_tag.into(),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Signal the consumer task and wait for it to finish its current message.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(
                    queue = %self.queue_name,
                    consumer_tag = %self.consumer_tag,
                    error = %e,
                    "Consumer task ended abnormally"
                );
            }
        }
        debug!(queue = %self.queue_name, consumer_tag = %self.consumer_tag, "Subscription stopped");
    }

    /// Drop the bookkeeping without touching the task. Used by a task that is
    /// already exiting on its own.
    fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Slot {
    /// Claimed by a subscribe that has not finished setting up
    Starting,
    Active(Subscription),
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub(crate) struct SubscriptionRegistry {
    backend: BackendKind,
    entries: Arc<DashMap<String, Slot>>,
}

impl SubscriptionRegistry {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Claim `queue_name`. The claim holds only this queue; other queues can
    /// be subscribed or unsubscribed while the caller does its I/O.
    pub fn reserve(&self, queue_name: &str) -> Result<Reservation<'_>> {
        match self.entries.entry(queue_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(QueueError::DuplicateSubscription {
                queue: queue_name.to_string(),
                backend: self.backend,
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Slot::Starting);
                Ok(Reservation {
                    registry: self,
                    queue_name: queue_name.to_string(),
                    filled: false,
                })
            }
        }
    }

    /// Take an active subscription out. A queue that is still starting has no
    /// subscription yet.
    pub fn remove(&self, queue_name: &str) -> Result<Subscription> {
        match self
            .entries
            .remove_if(queue_name, |_, slot| matches!(slot, Slot::Active(_)))
        {
            Some((_, Slot::Active(subscription))) => Ok(subscription),
            _ => Err(QueueError::MissingSubscription {
                queue: queue_name.to_string(),
                backend: self.backend,
            }),
        }
    }

    /// Forget the subscription of a consumer task that ended by itself.
    /// A newer subscription on the same queue is left alone.
    pub fn release(&self, queue_name: &str, consumer_tag: &str) -> bool {
        let removed = self.entries.remove_if(queue_name, |_, slot| {
            matches!(slot, Slot::Active(sub) if sub.consumer_tag == consumer_tag)
        });
        match removed {
            Some((_, Slot::Active(subscription))) => {
                subscription.detach();
                true
            }
            _ => false,
        }
    }

    /// Remove every entry. Subscribes still starting find their claim gone
    /// and give up.
    pub fn drain(&self) -> Vec<Subscription> {
        let queues: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        queues
            .into_iter()
            .filter_map(|queue| match self.entries.remove(&queue) {
                Some((_, Slot::Active(subscription))) => Some(subscription),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.entries
            .get(queue_name)
            .map(|slot| matches!(*slot, Slot::Active(_)))
            .unwrap_or(false)
    }
}

/// Claim on one queue name; released on drop unless filled.
pub(crate) struct Reservation<'a> {
    registry: &'a SubscriptionRegistry,
    queue_name: String,
    filled: bool,
}

impl Reservation<'_> {
    /// Install the subscription. Fails if the claim was drained in the
    /// meantime, in which case the subscription is dropped and its task
    /// aborted.
    pub fn fill(mut self, subscription: Subscription) -> Result<()> {
        let Some(mut slot) = self.registry.entries.get_mut(&self.queue_name) else {
            warn!(queue = %self.queue_name, "Subscription cancelled while starting");
            return Err(QueueError::MissingSubscription {
                queue: self.queue_name.clone(),
                backend: self.registry.backend,
            });
        };
        *slot = Slot::Active(subscription);
        self.filled = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry
                .entries
                .remove_if(&self.queue_name, |_, slot| matches!(slot, Slot::Starting));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn idle_subscription(queue: &str) -> (Subscription, Arc<AtomicBool>) {
        let (tx, rx) = oneshot::channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let task = tokio::spawn(async move {
            let _ = rx.await;
            flag.store(true, Ordering::SeqCst);
        });
        (Subscription::new(queue, format!("tag-{}", queue), tx, task), stopped)
    }

    #[tokio::test]
    async fn test_duplicate_reserve_is_rejected() {
        let registry = SubscriptionRegistry::new(BackendKind::Redis);
        let (sub, _) = idle_subscription("orders");
        registry.reserve("orders").unwrap().fill(sub).unwrap();

        match registry.reserve("orders") {
            Err(QueueError::DuplicateSubscription { queue, backend }) => {
                assert_eq!(queue, "orders");
                assert_eq!(backend, BackendKind::Redis);
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second reserve should fail"),
        };
    }

    #[tokio::test]
    async fn test_starting_queue_rejects_second_reserve() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        let _pending = registry.reserve("orders").unwrap();

        assert!(matches!(
            registry.reserve("orders"),
            Err(QueueError::DuplicateSubscription { .. })
        ));
        assert!(!registry.contains("orders"));
    }

    #[tokio::test]
    async fn test_pending_reserve_does_not_block_other_queues() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        let _pending = registry.reserve("a").unwrap();

        // Every operation on another queue completes while "a" is claimed
        assert!(matches!(
            registry.remove("b"),
            Err(QueueError::MissingSubscription { .. })
        ));
        assert!(!registry.contains("b"));
        let (sub, _) = idle_subscription("b");
        registry.reserve("b").unwrap().fill(sub).unwrap();
        assert!(registry.contains("b"));
        registry.remove("b").unwrap().stop().await;
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_queue() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        {
            let _slot = registry.reserve("orders").unwrap();
        }
        assert!(!registry.contains("orders"));
        assert!(registry.reserve("orders").is_ok());
    }

    #[tokio::test]
    async fn test_fill_after_drain_fails() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        let slot = registry.reserve("orders").unwrap();
        assert!(registry.drain().is_empty());

        let (sub, _) = idle_subscription("orders");
        assert!(matches!(
            slot.fill(sub),
            Err(QueueError::MissingSubscription { .. })
        ));
        assert!(!registry.contains("orders"));
    }

    #[tokio::test]
    async fn test_remove_missing_subscription() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        assert!(matches!(
            registry.remove("orders"),
            Err(QueueError::MissingSubscription { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_signals_task() {
        let registry = SubscriptionRegistry::new(BackendKind::Redis);
        let (sub, stopped) = idle_subscription("orders");
        registry.reserve("orders").unwrap().fill(sub).unwrap();

        registry.remove("orders").unwrap().stop().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_frees_queue_for_resubscribe() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        let (sub, _) = idle_subscription("orders");
        registry.reserve("orders").unwrap().fill(sub).unwrap();

        assert!(registry.release("orders", "tag-orders"));
        assert!(!registry.contains("orders"));

        let (again, _) = idle_subscription("orders");
        registry.reserve("orders").unwrap().fill(again).unwrap();
        assert!(registry.contains("orders"));
    }

    #[tokio::test]
    async fn test_release_ignores_newer_subscription() {
        let registry = SubscriptionRegistry::new(BackendKind::Amqp);
        let (sub, _) = idle_subscription("orders");
        registry.reserve("orders").unwrap().fill(sub).unwrap();

        assert!(!registry.release("orders", "tag-from-an-older-consumer"));
        assert!(registry.contains("orders"));
    }

    #[tokio::test]
    async fn test_dropping_registry_aborts_tasks() {
        let registry = SubscriptionRegistry::new(BackendKind::Redis);
        let (tx, _rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let abort_handle = task.abort_handle();
        registry
            .reserve("orders")
            .unwrap()
            .fill(Subscription::new("orders", "tag", tx, task))
            .unwrap();

        drop(registry);
        for _ in 0..100 {
            if abort_handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(abort_handle.is_finished());
    }
}
