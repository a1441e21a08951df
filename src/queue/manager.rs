//! Registry of live queues for one backend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::consumer::{Consumer, ConsumerOptions, MessageHandler};
use crate::error::QueueResult;
use crate::producer::Producer;

use super::backend::{Queue, QueueBackend};
use super::message::QueueOptions;

/// Maps queue names to live `Queue` handles, creating them on first access.
///
/// The registry lock is held across backend creation, so concurrent callers
/// asking for the same unseen name get the same instance and the backend
/// provisions it once.
///
/// # Example
///
/// ```rust,ignore
/// let manager = QueueManager::new(backend);
/// let producer = manager.producer("orders").await?;
/// producer.publish(Message::new("order-1", payload)).await?;
/// ```
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    queues: Mutex<HashMap<String, Arc<dyn Queue>>>,
    default_options: QueueOptions,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let default_options = backend.default_queue_options();
        Self {
            backend,
            queues: Mutex::new(HashMap::new()),
            default_options,
        }
    }

    /// Override the options used by `get_queue`.
    pub fn with_default_options(mut self, options: QueueOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Get a queue, creating it with the default options on first access.
    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        self.get_queue_with_options(name, self.default_options.clone()).await
    }

    /// Get a queue, creating it with `options` on first access. Options are
    /// fixed at creation; they are ignored for a name already registered.
    pub async fn get_queue_with_options(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<dyn Queue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let queue = self.backend.create_queue(name, options).await?;
        queues.insert(name.to_string(), queue.clone());

        tracing::info!(
            backend = %self.backend.backend_type(),
            queue = %name,
            "Queue registered"
        );
        Ok(queue)
    }

    /// Close the registered handle (if any) and delete the queue on the broker.
    pub async fn delete_queue(&self, name: &str) -> QueueResult<()> {
        let removed = self.queues.lock().await.remove(name);
        if let Some(queue) = removed {
            queue.close().await?;
        }
        self.backend.delete_queue(name).await?;

        tracing::info!(backend = %self.backend.backend_type(), queue = %name, "Queue deleted");
        Ok(())
    }

    /// Names currently registered in this manager, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and unregister every queue. All queues are closed even if some
    /// fail; the first error is returned.
    pub async fn close_all(&self) -> QueueResult<()> {
        let drained: Vec<(String, Arc<dyn Queue>)> = self.queues.lock().await.drain().collect();
        let mut first_error = None;

        for (name, queue) in drained {
            if let Err(e) = queue.close().await {
                tracing::warn!(queue = %name, error = %e, "Failed to close queue");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn producer(&self, name: &str) -> QueueResult<Producer> {
        Ok(Producer::new(self.get_queue(name).await?))
    }

    pub async fn consumer(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> QueueResult<Consumer> {
        Ok(Consumer::new(self.get_queue(name).await?, handler, options))
    }
}
