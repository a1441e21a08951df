//! Graceful shutdown of the queue layer.
//!
//! Order matters: consumers are stopped first so no worker is mid-pop when
//! its queue closes, then queues are closed, then the backend disconnects.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::signal;
use tokio::time::timeout;

use crate::consumer::Consumer;
use crate::queue::{QueueBackend, QueueManager};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for closing every registered queue (default: 10 seconds)
    pub close_timeout: Duration,
    /// Time allowed for the backend disconnect (default: 5 seconds)
    pub disconnect_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GracefulShutdown {
    consumers: Vec<Arc<Consumer>>,
    manager: Arc<QueueManager>,
    backend: Arc<dyn QueueBackend>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(consumers: Vec<Arc<Consumer>>, manager: Arc<QueueManager>) -> Self {
        Self::with_config(consumers, manager, ShutdownConfig::default())
    }

    pub fn with_config(consumers: Vec<Arc<Consumer>>, manager: Arc<QueueManager>, config: ShutdownConfig) -> Self {
        let backend = manager.backend().clone();
        Self {
            consumers,
            manager,
            backend,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(consumers = self.consumers.len(), backend = %self.backend.backend_type())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: stop consumers; each waits for its workers' current message
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping consumers");
        result.consumers_stopped = self.stop_consumers().await;

        // Phase 2: close registered queues
        tracing::info!("Phase 2: Closing queues");
        result.queues_closed = match timeout(self.config.close_timeout, self.manager.close_all()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Some queues failed to close");
                false
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.config.close_timeout.as_millis() as u64, "Queue close timed out");
                false
            }
        };

        // Phase 3: disconnect the backend
        tracing::info!("Phase 3: Disconnecting backend");
        result.backend_disconnected = match timeout(self.config.disconnect_timeout, self.backend.disconnect()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Backend disconnect failed");
                false
            }
            Err(_) => {
                tracing::warn!("Backend disconnect timed out");
                false
            }
        };

        result.duration = start.elapsed();
        result.success = result.queues_closed && result.backend_disconnected;

        tracing::info!(
            consumers_stopped = result.consumers_stopped,
            queues_closed = result.queues_closed,
            backend_disconnected = result.backend_disconnected,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn stop_consumers(&self) -> usize {
        let mut pending: FuturesUnordered<_> = self
            .consumers
            .iter()
            .filter(|consumer| consumer.is_running())
            .map(|consumer| async move { consumer.stop().await })
            .collect();

        let mut stopped = 0;
        while let Some(result) = pending.next().await {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!(error = %e, "Failed to stop consumer"),
            }
        }
        stopped
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub consumers_stopped: usize,
    pub queues_closed: bool,
    pub backend_disconnected: bool,
    pub duration: Duration,
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::consumer::{ConsumerOptions, MessageHandler};
    use crate::error::QueueError;
    use crate::queue::{MemoryBackend, Message};

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumers_and_closes_queues() {
        let backend = Arc::new(MemoryBackend::default());
        backend.connect().await.unwrap();
        let manager = Arc::new(QueueManager::new(backend.clone()));

        let options = ConsumerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..ConsumerOptions::default()
        };
        let consumer = Arc::new(manager.consumer("jobs", Arc::new(Noop), options).await.unwrap());
        consumer.start().await.unwrap();
        let queue = manager.get_queue("jobs").await.unwrap();

        let shutdown = GracefulShutdown::new(vec![consumer.clone()], manager.clone());
        let result = shutdown.execute("test").await;

        assert!(result.success);
        assert_eq!(result.consumers_stopped, 1);
        assert!(!consumer.is_running());
        assert!(manager.queue_names().await.is_empty());
        assert!(matches!(queue.size().await, Err(QueueError::Closed(_))));
        assert!(!backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_consumers() {
        let manager = Arc::new(QueueManager::new(Arc::new(MemoryBackend::default())));
        let result = GracefulShutdown::new(Vec::new(), manager).execute("test").await;
        assert!(result.success);
        assert_eq!(result.consumers_stopped, 0);
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(5));
    }
}
