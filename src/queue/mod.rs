//! Message queue abstraction over interchangeable broker backends.
//!
//! - `Message`, `QueueOptions`: the unit of work and queue provisioning options
//! - `Queue`, `QueueBackend`: the per-queue contract and the backend lifecycle
//! - `MemoryBackend`: in-process store, for tests and single-process use
//! - `RedisBackend`: Redis list for ready messages plus a sorted set for delayed ones
//! - `AmqpBackend`: one durable AMQP queue per name
//! - `QueueManager`: name to queue registry with lazy creation

mod amqp_backend;
mod backend;
mod factory;
mod manager;
mod memory_backend;
mod message;
mod redis_backend;

pub use amqp_backend::{AmqpBackend, AmqpQueue};
pub use backend::{BackendType, Queue, QueueBackend};
pub use factory::create_queue_backend;
pub use manager::QueueManager;
pub use memory_backend::{MemoryBackend, MemoryQueue};
pub use message::{Message, QueueOptions};
pub use redis_backend::{RedisBackend, RedisQueue};
