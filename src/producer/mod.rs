//! Message publishing.

use std::sync::Arc;

use crate::error::{QueueError, QueueResult};
use crate::queue::{Message, Queue};

/// Publishes messages to one queue.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn Queue>,
}

impl Producer {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    #[tracing::instrument(skip(self, message), fields(queue = %self.queue.name(), message_id = %message.id))]
    pub async fn publish(&self, message: Message) -> QueueResult<()> {
        self.queue.push(message).await
    }

    /// Push messages in order, stopping at the first failure.
    ///
    /// Messages pushed before the failure stay enqueued. The error is
    /// `QueueError::Publish` carrying the failing message's id. Returns the
    /// number of messages pushed.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<usize> {
        let total = messages.len();
        let mut published = 0;

        for message in messages {
            let id = message.id.clone();
            if let Err(e) = self.queue.push(message).await {
                tracing::warn!(
                    queue = %self.queue.name(),
                    message_id = %id,
                    published,
                    total,
                    error = %e,
                    "Batch publish stopped at failing message"
                );
                return Err(QueueError::Publish {
                    id,
                    source: Box::new(e),
                });
            }
            published += 1;
        }

        tracing::debug!(queue = %self.queue.name(), published, "Batch published");
        Ok(published)
    }
}
