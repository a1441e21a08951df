//! Queue backend factory

use std::sync::Arc;

use crate::config::Settings;
use crate::error::QueueResult;
use crate::infrastructure::amqp::AmqpConnection;
use crate::infrastructure::redis::RedisPool;

use super::amqp_backend::AmqpBackend;
use super::backend::QueueBackend;
use super::memory_backend::MemoryBackend;
use super::redis_backend::RedisBackend;

/// Create a queue backend based on configuration.
///
/// Returns the implementation named by `queue.backend`:
/// - `"redis"`: a `RedisBackend` over a new `RedisPool`
/// - `"amqp"`: an `AmqpBackend` over a new `AmqpConnection`
/// - `"memory"` (default): a `MemoryBackend`
///
/// Unknown selectors fall back to memory with a warning. Nothing is
/// connected yet; call `QueueBackend::connect` on the result.
///
/// # Example
///
/// ```rust,ignore
/// let backend = create_queue_backend(&settings)?;
/// backend.connect().await?;
/// let manager = QueueManager::new(backend);
/// ```
pub fn create_queue_backend(settings: &Settings) -> QueueResult<Arc<dyn QueueBackend>> {
    let options = settings.queue.queue_options();
    let pop_timeout = settings.queue.pop_timeout();

    let backend: Arc<dyn QueueBackend> = match settings.queue.backend.to_ascii_lowercase().as_str() {
        "redis" => {
            tracing::info!(
                backend = "redis",
                prefix = %settings.redis.prefix,
                pool_size = settings.redis.pool_size,
                "Creating Redis queue backend"
            );
            let pool = RedisPool::new(settings.redis.clone())?;
            Arc::new(RedisBackend::new(Arc::new(pool), options, pop_timeout))
        }
        "amqp" | "rabbitmq" => {
            tracing::info!(
                backend = "amqp",
                host = %settings.amqp.host,
                vhost = %settings.amqp.vhost,
                "Creating AMQP queue backend"
            );
            let connection = AmqpConnection::new(settings.amqp.clone());
            Arc::new(AmqpBackend::new(Arc::new(connection), options))
        }
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory queue backend");
            Arc::new(MemoryBackend::new(options, pop_timeout))
        }
        other => {
            tracing::warn!(
                backend = %other,
                "Unknown queue backend requested, falling back to memory"
            );
            Arc::new(MemoryBackend::new(options, pop_timeout))
        }
    };

    Ok(backend)
}
