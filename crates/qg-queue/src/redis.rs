//! Redis Job Queue
//!
//! Job-queue semantics on plain Redis structures, one set of keys per queue:
//! - `{prefix}:{queue}:wait`: list of job ids ready to run (FIFO)
//! - `{prefix}:{queue}:delayed`: sorted set of job ids scored by due time (ms)
//! - `{prefix}:{queue}:active`: list of job ids a worker has taken
//! - `{prefix}:{queue}:failed`: sorted set of job ids whose handler failed
//! - `{prefix}:{queue}:job:{id}`: hash with the job's data and timestamp
//!
//! The job id is the message id, so publishing the same message twice only
//! enqueues it once. `receive` peeks without taking jobs; a subscription runs
//! one worker that moves jobs from `wait` to `active` and completes or fails
//! them according to the handler's [`DeliveryOutcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use qg_common::{BackendKind, DeliveryOutcome, QueueMessage};
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::{invoke_isolated, MessageHandler, QueueError, QueueProvider, Result};

const WORKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const ENQUEUE_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], "name", ARGV[1], "data", ARGV[2], "timestamp", ARGV[3])
    redis.call("RPUSH", KEYS[2], ARGV[1])
    return 1
"#;

const ENQUEUE_DELAYED_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], "name", ARGV[1], "data", ARGV[2], "timestamp", ARGV[3], "delay", ARGV[4])
    redis.call("ZADD", KEYS[2], ARGV[5], ARGV[1])
    return 1
"#;

const REMOVE_SCRIPT: &str = r#"
    if redis.call("DEL", KEYS[1]) == 0 then
        return 0
    end
    redis.call("LREM", KEYS[2], 0, ARGV[1])
    redis.call("LREM", KEYS[3], 0, ARGV[1])
    redis.call("ZREM", KEYS[4], ARGV[1])
    redis.call("ZREM", KEYS[5], ARGV[1])
    return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
    for _, id in ipairs(due) do
        redis.call("ZREM", KEYS[1], id)
        redis.call("RPUSH", KEYS[2], id)
    end
    return #due
"#;

const COMPLETE_SCRIPT: &str = r#"
    redis.call("LREM", KEYS[1], 0, ARGV[1])
    return redis.call("DEL", KEYS[2])
"#;

const FAIL_SCRIPT: &str = r#"
    redis.call("LREM", KEYS[1], 0, ARGV[1])
    if redis.call("EXISTS", KEYS[2]) == 0 then
        return 0
    end
    redis.call("HSET", KEYS[2], "failedReason", ARGV[2], "finishedOn", ARGV[3])
    redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
    return 1
"#;

const OBLITERATE_SCRIPT: &str = r#"
    local ids = {}
    for _, id in ipairs(redis.call("LRANGE", KEYS[1], 0, -1)) do table.insert(ids, id) end
    for _, id in ipairs(redis.call("LRANGE", KEYS[2], 0, -1)) do table.insert(ids, id) end
    for _, id in ipairs(redis.call("ZRANGE", KEYS[3], 0, -1)) do table.insert(ids, id) end
    for _, id in ipairs(redis.call("ZRANGE", KEYS[4], 0, -1)) do table.insert(ids, id) end
    for _, id in ipairs(ids) do redis.call("DEL", ARGV[1] .. id) end
    redis.call("DEL", KEYS[1], KEYS[2], KEYS[3], KEYS[4])
    return #ids
"#;

/// Configuration for the Redis job queue
#[derive(Debug, Clone)]
pub struct RedisJobQueueConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Prefix for every key this adapter writes
    pub prefix: String,
    /// How long a worker blocks waiting for a job before re-checking shutdown
    pub block_timeout: Duration,
}

impl Default for RedisJobQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            prefix: "qg".to_string(),
            block_timeout: Duration::from_secs(1),
        }
    }
}

/// Job body as stored in the job hash
#[derive(Debug, Serialize, Deserialize)]
struct JobData {
    payload: serde_json::Value,
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
}

/// Redis keys of one named queue
#[derive(Debug)]
struct JobQueue {
    name: String,
    wait: String,
    active: String,
    delayed: String,
    failed: String,
    job_prefix: String,
}

impl JobQueue {
    fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{}:{}", prefix, name);
        Self {
            name: name.to_string(),
            wait: format!("{}:wait", base),
            active: format!("{}:active", base),
            delayed: format!("{}:delayed", base),
            failed: format!("{}:failed", base),
            job_prefix: format!("{}:job:", base),
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }

    /// Load job hashes for `ids`, skipping jobs removed in the meantime.
    async fn load<C>(&self, conn: &mut C, ids: &[String]) -> Result<Vec<QueueMessage>>
    where
        C: ConnectionLike + Send,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HMGET").arg(self.job_key(id)).arg("data").arg("timestamp");
        }
        let rows: Vec<(Option<String>, Option<i64>)> = pipe.query_async(conn).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, (data, timestamp)) in ids.iter().zip(rows) {
            let Some(data) = data else {
                debug!(queue = %self.name, job_id = %id, "Job disappeared before it was loaded");
                continue;
            };
            let job: JobData = serde_json::from_str(&data)?;
            let created_at = timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            messages.push(QueueMessage {
                id: id.clone(),
                queue_name: self.name.clone(),
                payload: job.payload,
                attributes: job.attributes,
                receipt_handle: Some(id.clone()),
                created_at,
            });
        }
        Ok(messages)
    }

    async fn complete<C>(&self, conn: &mut C, id: &str) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        let _: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(&self.active)
            .key(self.job_key(id))
            .arg(id)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    async fn fail<C>(&self, conn: &mut C, id: &str, reason: &str) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        let _: i64 = redis::Script::new(FAIL_SCRIPT)
            .key(&self.active)
            .key(self.job_key(id))
            .key(&self.failed)
            .arg(id)
            .arg(reason)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

/// Redis-backed job queue provider
pub struct RedisJobQueue {
    config: RedisJobQueueConfig,
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    queues: DashMap<String, Arc<JobQueue>>,
    workers: SubscriptionRegistry,
}

impl RedisJobQueue {
    /// Create the adapter. No connection is opened until first use.
    pub fn new(config: RedisJobQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            config,
            client,
            connection: Mutex::new(None),
            queues: DashMap::new(),
            workers: SubscriptionRegistry::new(BackendKind::Redis),
        })
    }

    pub fn with_url(url: &str) -> Result<Self> {
        Self::new(RedisJobQueueConfig {
            url: url.to_string(),
            ..Default::default()
        })
    }

    /// Shared connection, opened on first use.
    async fn conn(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone()).await?;
        info!(url = %self.config.url, "Connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Cached queue handle; created on first use.
    fn queue(&self, name: &str) -> Arc<JobQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(JobQueue::new(&self.config.prefix, name)))
            .clone()
    }

    /// Enqueue a job that becomes runnable after `delay`. Until then it is
    /// visible to `receive` after the waiting jobs.
    pub async fn publish_delayed(&self, message: &QueueMessage, delay: Duration) -> Result<String> {
        let queue = self.queue(&message.queue_name);
        let mut conn = self.conn().await?;
        let data = encode_job(message)?;
        let delay_ms = delay.as_millis() as i64;
        let due_at = Utc::now().timestamp_millis() + delay_ms;

        let added: i64 = redis::Script::new(ENQUEUE_DELAYED_SCRIPT)
            .key(queue.job_key(&message.id))
            .key(&queue.delayed)
            .arg(&message.id)
            .arg(data)
            .arg(message.created_at.timestamp_millis())
            .arg(delay_ms)
            .arg(due_at)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            queue = %queue.name,
            message_id = %message.id,
            delay_ms,
            duplicate = added == 0,
            "Delayed job enqueued"
        );
        Ok(message.id.clone())
    }

    pub async fn is_subscribed(&self, queue_name: &str) -> bool {
        self.workers.contains(queue_name)
    }
}

fn encode_job(message: &QueueMessage) -> Result<String> {
    Ok(serde_json::to_string(&JobData {
        payload: message.payload.clone(),
        attributes: message.attributes.clone(),
    })?)
}

#[async_trait]
impl QueueProvider for RedisJobQueue {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let result = async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, QueueError>(())
        }
        .await;

        result.map_err(|e| QueueError::Connection {
            backend: BackendKind::Redis,
            attempts: 1,
            reason: e.to_string(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        for worker in self.workers.drain() {
            worker.stop().await;
        }
        self.queues.clear();
        *self.connection.lock().await = None;

        info!("Redis job queue disconnected");
        Ok(())
    }

    async fn publish(&self, message: &QueueMessage) -> Result<String> {
        let queue = self.queue(&message.queue_name);
        let mut conn = self.conn().await?;
        let data = encode_job(message)?;

        let added: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(queue.job_key(&message.id))
            .key(&queue.wait)
            .arg(&message.id)
            .arg(data)
            .arg(message.created_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            debug!(queue = %queue.name, message_id = %message.id, "Job already exists, not enqueued again");
        } else {
            debug!(queue = %queue.name, message_id = %message.id, "Job enqueued");
        }
        Ok(message.id.clone())
    }

    async fn receive(&self, queue_name: &str, max_messages: usize) -> Result<Vec<QueueMessage>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let queue = self.queue(queue_name);
        let mut conn = self.conn().await?;

        let last = max_messages as isize - 1;
        let mut ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&queue.wait)
            .arg(0)
            .arg(last)
            .query_async(&mut conn)
            .await?;

        if ids.len() < max_messages {
            let remaining = (max_messages - ids.len()) as isize - 1;
            let delayed: Vec<String> = redis::cmd("ZRANGE")
                .arg(&queue.delayed)
                .arg(0)
                .arg(remaining)
                .query_async(&mut conn)
                .await?;
            ids.extend(delayed);
        }

        let messages = queue.load(&mut conn, &ids).await?;
        if !messages.is_empty() {
            debug!(queue = %queue_name, count = messages.len(), "Peeked jobs from Redis");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, queue_name: &str, receipt_handle: &str) -> Result<()> {
        let queue = self.queue(queue_name);
        let mut conn = self.conn().await?;

        let removed: i64 = redis::Script::new(REMOVE_SCRIPT)
            .key(queue.job_key(receipt_handle))
            .key(&queue.wait)
            .key(&queue.active)
            .key(&queue.delayed)
            .key(&queue.failed)
            .arg(receipt_handle)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            debug!(queue = %queue_name, receipt_handle = %receipt_handle, "Job not found, nothing to acknowledge");
        }
        Ok(())
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String> {
        self.queue(queue_name);
        debug!(queue = %queue_name, "Redis queue ready");
        Ok(queue_name.to_string())
    }

    async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let queue = self.queue(queue_name);
        let mut conn = self.conn().await?;

        let removed: i64 = redis::Script::new(OBLITERATE_SCRIPT)
            .key(&queue.wait)
            .key(&queue.active)
            .key(&queue.delayed)
            .key(&queue.failed)
            .arg(&queue.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        self.queues.remove(queue_name);
        info!(queue = %queue_name, jobs_removed = removed, "Redis queue deleted");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        // Throwaway connection, independent of the shared one
        let result = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Redis health check failed");
                false
            }
        }
    }

    async fn subscribe_to_queue(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let slot = self.workers.reserve(queue_name)?;

        // Blocking pops need a connection of their own
        let conn = self.client.get_multiplexed_async_connection().await?;
        let worker = Worker {
            queue: self.queue(queue_name),
            conn,
            handler,
            block_timeout: self.config.block_timeout,
        };

        let worker_id = format!("worker-{}-{}", queue_name, uuid::Uuid::new_v4());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(worker.run(shutdown_rx));

        slot.fill(Subscription::new(queue_name, worker_id.clone(), shutdown_tx, task))?;
        info!(queue = %queue_name, worker_id = %worker_id, "Subscribed to Redis queue");
        Ok(())
    }

    async fn unsubscribe_from_queue(&self, queue_name: &str) -> Result<()> {
        let worker = self.workers.remove(queue_name)?;
        worker.stop().await;
        info!(queue = %queue_name, "Unsubscribed from Redis queue");
        Ok(())
    }
}

/// Dedicated consumer for one queue
struct Worker {
    queue: Arc<JobQueue>,
    conn: MultiplexedConnection,
    handler: Arc<dyn MessageHandler>,
    block_timeout: Duration,
}

impl Worker {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        debug!(queue = %self.queue.name, "Redis worker started");

        loop {
            // Checked between jobs only, so a taken job is always finished
            match shutdown_rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => break,
            }

            match self.next_job().await {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.queue.name, error = %e, "Redis worker failed to fetch job");
                    tokio::time::sleep(WORKER_ERROR_BACKOFF).await;
                }
            }
        }

        debug!(queue = %self.queue.name, "Redis worker stopped");
    }

    /// Promote due delayed jobs, then block for the next waiting job.
    async fn next_job(&mut self) -> Result<Option<QueueMessage>> {
        let _: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(&self.queue.delayed)
            .key(&self.queue.wait)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn)
            .await?;

        let id: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue.wait)
            .arg(&self.queue.active)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(self.block_timeout.as_secs_f64())
            .query_async(&mut self.conn)
            .await?;

        let Some(id) = id else {
            return Ok(None);
        };

        let mut loaded = self.queue.load(&mut self.conn, std::slice::from_ref(&id)).await?;
        match loaded.pop() {
            Some(message) => Ok(Some(message)),
            None => {
                // Acknowledged or deleted between the move and the load
                self.queue.complete(&mut self.conn, &id).await?;
                Ok(None)
            }
        }
    }

    async fn process(&mut self, message: QueueMessage) {
        let job_id = message.id.clone();
        let outcome = invoke_isolated(self.handler.as_ref(), message).await;

        let result = match &outcome {
            DeliveryOutcome::Processed => {
                debug!(queue = %self.queue.name, job_id = %job_id, "Job completed");
                self.queue.complete(&mut self.conn, &job_id).await
            }
            DeliveryOutcome::Failed(reason) => {
                let failure = QueueError::DeliveryHandler {
                    backend: BackendKind::Redis,
                    queue: self.queue.name.clone(),
                    reason: reason.clone(),
                };
                error!(job_id = %job_id, error = %failure, "Job moved to failed set");
                self.queue.fail(&mut self.conn, &job_id, reason).await
            }
        };

        if let Err(e) = result {
            error!(queue = %self.queue.name, job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisJobQueueConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.prefix, "qg");
        assert_eq!(config.block_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_queue_keys() {
        let queue = JobQueue::new("qg", "orders");
        assert_eq!(queue.wait, "qg:orders:wait");
        assert_eq!(queue.delayed, "qg:orders:delayed");
        assert_eq!(queue.job_key("abc"), "qg:orders:job:abc");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            RedisJobQueue::with_url("not a url"),
            Err(QueueError::Redis(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_handles_are_cached() {
        let adapter = RedisJobQueue::with_url("redis://127.0.0.1:6379").unwrap();
        let first = adapter.queue("orders");
        let second = adapter.queue("orders");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(adapter.create_queue("orders").await.unwrap(), "orders");
        assert_eq!(adapter.queues.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_zero_messages_skips_redis() {
        // Nothing listens on this port; a zero-sized receive must not connect.
        let adapter = RedisJobQueue::with_url("redis://127.0.0.1:1").unwrap();
        assert!(adapter.receive("orders", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_false_when_unreachable() {
        let adapter = RedisJobQueue::with_url("redis://127.0.0.1:1").unwrap();
        assert!(!adapter.health_check().await);
    }

    #[test]
    fn test_job_data_roundtrip_keeps_attributes() {
        let mut attrs = HashMap::new();
        attrs.insert("source".to_string(), "billing".to_string());
        let message = QueueMessage::create("orders", serde_json::json!({"id": 7}), Some(attrs));

        let encoded = encode_job(&message).unwrap();
        let decoded: JobData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.payload["id"], 7);
        assert_eq!(decoded.attributes.unwrap()["source"], "billing");
    }
}
