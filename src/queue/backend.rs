//! Backend traits for queue storage.
//!
//! `Queue` is the per-name operation contract every backend honours
//! identically from the caller's perspective. `QueueBackend` covers the
//! connection lifecycle and queue provisioning for one broker technology.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

use super::message::{Message, QueueOptions};

/// Broker technology behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Memory,
    Redis,
    Amqp,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Memory => "memory",
            BackendType::Redis => "redis",
            BackendType::Amqp => "amqp",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations on one named queue.
///
/// # Thread Safety
///
/// Implementations are shared as `Arc<dyn Queue>` between every worker of
/// a consumer and any number of producers, so all methods take `&self`.
///
/// # Empty vs. failed
///
/// The pop operations return `Ok(None)` when nothing became available
/// before the wait elapsed. That is never an error, and it does not prove
/// the queue is empty: check `size()` for that.
///
/// # Cancellation
///
/// The pop futures are not guaranteed to be cancel-safe. Dropping one
/// mid-flight may lose the message it was receiving. Bound the wait with
/// `pop_with_timeout` instead of racing the future against something else.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Store a message, stamping its timestamp if unset.
    ///
    /// A message with a delay is not returned by any pop before
    /// push time + delay. Fails with `QueueFull` only on backends that
    /// enforce `QueueOptions::max_length`.
    async fn push(&self, message: Message) -> QueueResult<()>;

    /// Retrieve and remove the next eligible message, waiting up to the
    /// backend's blocking interval.
    async fn pop(&self) -> QueueResult<Option<Message>>;

    /// Like `pop` with an explicit bound. A zero timeout checks once
    /// without waiting.
    async fn pop_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Message>>;

    /// Look at the next message without removing it. Not a reservation:
    /// another consumer may take the message right after.
    async fn peek(&self) -> QueueResult<Option<Message>>;

    /// Ready plus delayed messages.
    async fn size(&self) -> QueueResult<u64>;

    /// Remove every ready and delayed message.
    async fn clear(&self) -> QueueResult<()>;

    /// Release per-queue resources. Shared connections stay open.
    /// Idempotent; every other operation fails with `Closed` afterwards.
    async fn close(&self) -> QueueResult<()>;
}

/// Connection lifecycle and queue provisioning for one broker technology.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Connect, retrying with exponential backoff before giving up.
    async fn connect(&self) -> QueueResult<()>;

    async fn disconnect(&self) -> QueueResult<()>;

    async fn is_connected(&self) -> bool;

    /// Liveness check against the broker.
    async fn health_check(&self) -> QueueResult<()>;

    /// Provision a queue (idempotent on the broker side) and return a handle.
    async fn create_queue(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<dyn Queue>>;

    /// Remove a queue and all its messages from the broker.
    async fn delete_queue(&self, name: &str) -> QueueResult<()>;

    async fn list_queues(&self) -> QueueResult<Vec<String>>;

    /// Options applied by `QueueManager::get_queue`.
    fn default_queue_options(&self) -> QueueOptions;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_labels() {
        assert_eq!(BackendType::Memory.as_str(), "memory");
        assert_eq!(BackendType::Redis.to_string(), "redis");
        assert_eq!(format!("{}", BackendType::Amqp), "amqp");
    }
}
