//! One consumer worker: poll, dispatch, retry.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::metrics::ConsumerMetrics;
use crate::resilience::deadline_after;
use crate::queue::{Message, Queue};

use super::handler::MessageHandler;
use super::options::ConsumerOptions;

/// How processing of one message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Handled,
    /// `on_error` failed; no further attempts
    Abandoned,
    /// Retry budget spent
    Exhausted,
    /// Shutdown arrived during a retry wait
    Interrupted,
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) options: ConsumerOptions,
    pub(crate) shutdown: CancellationToken,
}

impl Worker {
    /// Poll until shutdown. Pops are never raced against the shutdown token
    /// because a dropped pop can lose its message; each pop is bounded by
    /// the poll interval instead.
    pub(crate) async fn run(self) {
        let queue_name = self.queue.name().to_string();
        ConsumerMetrics::worker_started(&queue_name);
        tracing::debug!(queue = %queue_name, worker = self.id, "Consumer worker started");

        while !self.shutdown.is_cancelled() {
            match self.queue.pop_with_timeout(self.options.poll_interval).await {
                Ok(Some(message)) => {
                    self.process(message).await;
                }
                Ok(None) => {}
                Err(QueueError::Closed(_)) => {
                    tracing::warn!(queue = %queue_name, worker = self.id, "Queue closed, worker exiting");
                    break;
                }
                Err(e) => {
                    tracing::warn!(queue = %queue_name, worker = self.id, error = %e, "Failed to pop message");
                    // Pause so a dead broker is not polled in a tight loop
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
            }
        }

        ConsumerMetrics::worker_stopped(&queue_name);
        tracing::debug!(queue = %queue_name, worker = self.id, "Consumer worker stopped");
    }

    /// Dispatch one message, retrying with a fixed delay.
    ///
    /// Every handler call shares one deadline of `handler_timeout` from the
    /// start of processing; an elapsed deadline counts as a failure. Each
    /// `on_error` call is bounded by `handler_timeout` on its own.
    #[tracing::instrument(
        skip(self, message),
        fields(queue = %self.queue.name(), worker = self.id, message_id = %message.id)
    )]
    pub(crate) async fn process(&self, mut message: Message) -> Outcome {
        let queue_name = self.queue.name();
        let deadline = deadline_after(self.options.handler_timeout);

        loop {
            let started = Instant::now();
            let result = tokio::time::timeout_at(deadline, self.handler.handle(&message)).await;
            let latency = started.elapsed().as_secs_f64();

            let error = match result {
                Ok(Ok(())) => {
                    ConsumerMetrics::record_success(queue_name, latency);
                    tracing::debug!(retry_count = message.retry_count, "Message handled");
                    return Outcome::Handled;
                }
                Ok(Err(error)) => {
                    ConsumerMetrics::record_failure(queue_name, latency);
                    error
                }
                Err(_) => {
                    ConsumerMetrics::record_timeout(queue_name);
                    anyhow::anyhow!("handler timed out after {:?}", self.options.handler_timeout)
                }
            };

            tracing::warn!(retry_count = message.retry_count, error = %error, "Message handler failed");

            // The error callback gets its own budget; the handler deadline may already be spent
            let callback = tokio::time::timeout(self.options.handler_timeout, self.handler.on_error(&message, &error)).await;
            let callback_error = match callback {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(anyhow::anyhow!("error callback timed out")),
            };
            if let Some(callback_error) = callback_error {
                ConsumerMetrics::record_dropped(queue_name, "error_callback_failed");
                tracing::error!(error = %callback_error, "Error callback failed, abandoning message");
                return Outcome::Abandoned;
            }

            message.retry_count += 1;
            if message.retry_count > self.options.max_retries {
                ConsumerMetrics::record_dropped(queue_name, "retries_exhausted");
                tracing::warn!(
                    retry_count = message.retry_count,
                    max_retries = self.options.max_retries,
                    "Retries exhausted, dropping message"
                );
                return Outcome::Exhausted;
            }

            ConsumerMetrics::record_retry(queue_name);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    ConsumerMetrics::record_dropped(queue_name, "shutdown");
                    tracing::info!(retry_count = message.retry_count, "Shutdown during retry wait, dropping message");
                    return Outcome::Interrupted;
                }
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }
    }
}
