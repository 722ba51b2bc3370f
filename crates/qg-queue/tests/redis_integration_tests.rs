//! Redis Job Queue Integration Tests
//!
//! These tests require Redis to be running:
//! docker run -d -p 6379:6379 redis:7
//!
//! Tests for:
//! - Publish / peek / acknowledge
//! - Deduplication by message id
//! - Worker subscription lifecycle
//! - Failed jobs are not redelivered
//! - Delayed jobs

#![cfg(feature = "redis")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qg_common::{DeliveryOutcome, QueueMessage};
use qg_queue::redis::{RedisJobQueue, RedisJobQueueConfig};
use qg_queue::{handler_fn, QueueError, QueueProvider};
use serde_json::json;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

fn test_queue() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}

async fn adapter() -> Option<RedisJobQueue> {
    let adapter = RedisJobQueue::new(RedisJobQueueConfig {
        url: REDIS_URL.to_string(),
        prefix: "qg-test".to_string(),
        block_timeout: Duration::from_millis(200),
    })
    .ok()?;

    if !adapter.health_check().await {
        eprintln!("Skipping test - Redis not available");
        return None;
    }
    Some(adapter)
}

async fn wait_for(counter: &AtomicU32, expected: u32) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_publish_receive_acknowledge() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();
    adapter.connect().await.unwrap();

    let message = QueueMessage::create(&queue, json!({"orderId": 1}), None);
    let id = adapter.publish(&message).await.unwrap();
    assert_eq!(id, message.id);

    let received = adapter.receive(&queue, 10).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, json!({"orderId": 1}));
    let handle = received[0].receipt_handle.clone().unwrap();
    assert!(!handle.is_empty());

    // Peek does not consume
    assert_eq!(adapter.receive(&queue, 10).await.unwrap().len(), 1);

    adapter.acknowledge(&queue, &handle).await.unwrap();
    adapter.acknowledge(&queue, &handle).await.unwrap();
    assert!(adapter.receive(&queue, 10).await.unwrap().is_empty());

    adapter.delete_queue(&queue).await.unwrap();
    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_republish_same_id_is_idempotent() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();

    let message = QueueMessage::create(&queue, json!("once"), None);
    adapter.publish(&message).await.unwrap();
    adapter.publish(&message).await.unwrap();

    assert_eq!(adapter.receive(&queue, 10).await.unwrap().len(), 1);
    adapter.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn test_receive_respects_max_messages() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();

    for n in 0..5 {
        adapter
            .publish(&QueueMessage::create(&queue, json!(n), None))
            .await
            .unwrap();
    }

    let received = adapter.receive(&queue, 3).await.unwrap();
    let payloads: Vec<_> = received.iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);

    adapter.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn test_worker_processes_jobs() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();
    let processed = Arc::new(AtomicU32::new(0));

    let counter = processed.clone();
    let handler = handler_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            DeliveryOutcome::Processed
        }
    });

    adapter.subscribe_to_queue(&queue, handler.clone()).await.unwrap();
    assert!(adapter.is_subscribed(&queue).await);
    assert!(matches!(
        adapter.subscribe_to_queue(&queue, handler).await,
        Err(QueueError::DuplicateSubscription { .. })
    ));

    adapter
        .publish(&QueueMessage::create(&queue, json!({"n": 1}), None))
        .await
        .unwrap();
    wait_for(&processed, 1).await;
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert!(adapter.receive(&queue, 10).await.unwrap().is_empty());

    adapter.unsubscribe_from_queue(&queue).await.unwrap();
    assert!(matches!(
        adapter.unsubscribe_from_queue(&queue).await,
        Err(QueueError::MissingSubscription { .. })
    ));

    adapter.delete_queue(&queue).await.unwrap();
    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_not_redelivered() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let handler = handler_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            DeliveryOutcome::failed("rejected by test")
        }
    });

    adapter.subscribe_to_queue(&queue, handler).await.unwrap();
    adapter
        .publish(&QueueMessage::create(&queue, json!("bad"), None))
        .await
        .unwrap();

    wait_for(&attempts, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(adapter.receive(&queue, 10).await.unwrap().is_empty());

    adapter.disconnect().await.unwrap();
    adapter.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn test_delayed_jobs_follow_waiting_jobs() {
    let Some(adapter) = adapter().await else { return };
    let queue = test_queue();

    let delayed = QueueMessage::create(&queue, json!("later"), None);
    let waiting = QueueMessage::create(&queue, json!("now"), None);
    adapter
        .publish_delayed(&delayed, Duration::from_secs(60))
        .await
        .unwrap();
    adapter.publish(&waiting).await.unwrap();

    let received = adapter.receive(&queue, 10).await.unwrap();
    let ids: Vec<_> = received.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![waiting.id, delayed.id]);

    adapter.delete_queue(&queue).await.unwrap();
    assert!(adapter.receive(&queue, 10).await.unwrap().is_empty());
}
