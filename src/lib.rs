//! Message queue abstraction with interchangeable backends.
//!
//! Producers push `Message`s to a named `Queue`; a `Consumer` runs a pool
//! of workers that pop them and hand them to a `MessageHandler`, retrying
//! failures a bounded number of times. Backends: in-process memory, Redis
//! (list plus sorted set for delayed delivery) and AMQP.

// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::resilience;

// Queue layer
pub mod consumer;
pub mod producer;
pub mod queue;

// Supporting modules
pub mod shutdown;
pub mod telemetry;

pub use consumer::{Consumer, ConsumerOptions, MessageHandler};
pub use error::{QueueError, QueueResult};
pub use producer::Producer;
pub use queue::{create_queue_backend, BackendType, Message, Queue, QueueBackend, QueueManager, QueueOptions};
