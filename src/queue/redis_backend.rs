//! Redis-based queue backend using a list and a sorted set per queue.
//!
//! Ready messages are JSON strings in a list, `{prefix}:{name}`, appended
//! with RPUSH and taken with LPOP/BLPOP. Delayed messages live in a sorted
//! set, `{prefix}:{name}:delayed`, scored by their release time in Unix
//! epoch seconds. Sorted set members are unique, so each delayed message is
//! wrapped as `{"n":<uuid>,"m":<message>}` and two identical pushes stay two
//! entries. Every pop checks the sorted set for one released entry before it
//! waits on the list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::infrastructure::redis::{RedisPool, RedisPoolExt};
use crate::metrics::QueueMetrics;

use super::backend::{BackendType, Queue, QueueBackend};
use super::message::{Message, QueueOptions};

const BACKEND: &str = "redis";

/// Redis-based queue backend.
///
/// Owns the connection pool. Queues created here share it and never close it.
/// `message_ttl` and the dead-letter options have no Redis counterpart and
/// are ignored; `max_length` is enforced at push time.
pub struct RedisBackend {
    pool: Arc<RedisPool>,
    default_options: QueueOptions,
    pop_timeout: Duration,
}

impl RedisBackend {
    pub fn new(pool: Arc<RedisPool>, default_options: QueueOptions, pop_timeout: Duration) -> Self {
        Self {
            pool,
            default_options,
            pop_timeout,
        }
    }

    /// Set of provisioned queue names
    fn registry_key(&self) -> String {
        format!("{}:queues", self.pool.prefix())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Redis
    }

    async fn connect(&self) -> QueueResult<()> {
        self.pool.connect().await?;
        tracing::info!(backend = BACKEND, "Queue backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.pool.disconnect().await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.pool.is_healthy()
    }

    async fn health_check(&self) -> QueueResult<()> {
        self.pool.ping().await
    }

    async fn create_queue(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<dyn Queue>> {
        self.pool.sadd(&self.registry_key(), name).await?;

        tracing::debug!(backend = BACKEND, queue = %name, "Queue created");

        Ok(Arc::new(RedisQueue {
            name: name.to_string(),
            list_key: list_key(self.pool.prefix(), name),
            delayed_key: delayed_key(self.pool.prefix(), name),
            pool: self.pool.clone(),
            options,
            pop_timeout: self.pop_timeout,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_queue(&self, name: &str) -> QueueResult<()> {
        let prefix = self.pool.prefix();
        self.pool
            .del_many(&[list_key(prefix, name), delayed_key(prefix, name)])
            .await?;
        self.pool.srem(&self.registry_key(), name).await?;

        tracing::debug!(backend = BACKEND, queue = %name, "Queue deleted");
        Ok(())
    }

    async fn list_queues(&self) -> QueueResult<Vec<String>> {
        let mut names = self.pool.smembers(&self.registry_key()).await?;
        names.sort();
        Ok(names)
    }

    fn default_queue_options(&self) -> QueueOptions {
        self.default_options.clone()
    }
}

fn list_key(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

fn delayed_key(prefix: &str, name: &str) -> String {
    format!("{}:{}:delayed", prefix, name)
}

/// Unix epoch seconds with millisecond precision
fn epoch_seconds_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn release_score(delay: Duration) -> f64 {
    epoch_seconds_now() + delay.as_millis() as f64 / 1000.0
}

#[derive(Serialize)]
struct DelayedEntryRef<'a> {
    n: String,
    m: &'a Message,
}

#[derive(Deserialize)]
struct DelayedEntry {
    m: Message,
}

fn encode_delayed(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DelayedEntryRef {
        n: Uuid::new_v4().simple().to_string(),
        m: message,
    })
}

fn decode_delayed(member: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str::<DelayedEntry>(member).map(|entry| entry.m)
}

/// Handle onto one Redis queue.
pub struct RedisQueue {
    name: String,
    list_key: String,
    delayed_key: String,
    pool: Arc<RedisPool>,
    options: QueueOptions,
    pop_timeout: Duration,
    closed: AtomicBool,
}

impl RedisQueue {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Account for an entry that has already been removed from Redis.
    fn taken(&self, decoded: Result<Message, serde_json::Error>) -> QueueResult<Message> {
        match decoded {
            Ok(message) => {
                QueueMetrics::record_popped(BACKEND, &self.name);
                Ok(message)
            }
            Err(e) => {
                QueueMetrics::record_poison_discarded(BACKEND, &self.name);
                tracing::warn!(
                    backend = BACKEND,
                    queue = %self.name,
                    error = %e,
                    "Removed an undecodable message from the queue"
                );
                Err(e.into())
            }
        }
    }

    /// Claim the earliest released delayed entry, if any.
    ///
    /// ZREM decides the race between workers; the loser gets `None` and
    /// falls through to the ready list.
    async fn claim_delayed(&self) -> QueueResult<Option<Message>> {
        let due = self
            .pool
            .zrangebyscore_limit(&self.delayed_key, epoch_seconds_now(), 1)
            .await?;

        let Some(member) = due.into_iter().next() else {
            return Ok(None);
        };

        if self.pool.zrem(&self.delayed_key, &member).await? == 0 {
            return Ok(None);
        }
        self.taken(decode_delayed(&member)).map(Some)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, mut message: Message) -> QueueResult<()> {
        self.ensure_open()?;
        message.stamp();

        if let Some(max_length) = self.options.max_length {
            let size = self.pool.llen(&self.list_key).await? + self.pool.zcard(&self.delayed_key).await?;
            if size >= max_length {
                return Err(QueueError::QueueFull {
                    name: self.name.clone(),
                    max_length,
                });
            }
        }

        let delayed = message.is_delayed();
        if delayed {
            let member = encode_delayed(&message)?;
            self.pool
                .zadd(&self.delayed_key, release_score(message.delay), &member)
                .await?;
        } else {
            self.pool.rpush(&self.list_key, &message.to_json()?).await?;
        }

        QueueMetrics::record_pushed(BACKEND, &self.name, delayed);
        tracing::debug!(
            backend = BACKEND,
            queue = %self.name,
            message_id = %message.id,
            delayed,
            "Message pushed"
        );
        Ok(())
    }

    async fn pop(&self) -> QueueResult<Option<Message>> {
        self.pop_with_timeout(self.pop_timeout).await
    }

    async fn pop_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Message>> {
        self.ensure_open()?;

        if let Some(message) = self.claim_delayed().await? {
            return Ok(Some(message));
        }

        let raw = if timeout.is_zero() {
            self.pool.lpop(&self.list_key).await?
        } else {
            self.pool.blpop(&self.list_key, timeout).await?
        };

        match raw {
            Some(raw) => self.taken(Message::from_json(raw.as_bytes())).map(Some),
            None => Ok(None),
        }
    }

    async fn peek(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;

        let due = self
            .pool
            .zrangebyscore_limit(&self.delayed_key, epoch_seconds_now(), 1)
            .await?;
        if let Some(member) = due.into_iter().next() {
            return Ok(Some(decode_delayed(&member)?));
        }

        match self.pool.lindex(&self.list_key, 0).await? {
            Some(raw) => Ok(Some(Message::from_json(raw.as_bytes())?)),
            None => Ok(None),
        }
    }

    async fn size(&self) -> QueueResult<u64> {
        self.ensure_open()?;
        Ok(self.pool.llen(&self.list_key).await? + self.pool.zcard(&self.delayed_key).await?)
    }

    /// One multi-key DEL, so ready and delayed entries vanish together.
    async fn clear(&self) -> QueueResult<()> {
        self.ensure_open()?;
        self.pool
            .del_many(&[self.list_key.clone(), self.delayed_key.clone()])
            .await
    }

    async fn close(&self) -> QueueResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(backend = BACKEND, queue = %self.name, "Queue closed");
        }
        Ok(())
    }
}
