use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use ara_mq::config::Settings;
use ara_mq::consumer::{Consumer, MessageHandler};
use ara_mq::metrics::encode_metrics;
use ara_mq::queue::{create_queue_backend, Message, QueueManager};
use ara_mq::shutdown::{shutdown_signal, GracefulShutdown};
use ara_mq::telemetry::init_telemetry;

/// Logs every message it receives.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        tracing::info!(
            message_id = %message.id,
            bytes = message.data.len(),
            retry_count = message.retry_count,
            headers = ?message.headers,
            "Received message"
        );
        Ok(())
    }

    async fn on_error(&self, message: &Message, error: &anyhow::Error) -> Result<()> {
        tracing::warn!(message_id = %message.id, error = %error, "Message handling failed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.otel, &settings.log_level)?;
    tracing::info!(backend = %settings.queue.backend, "Configuration loaded");

    let backend = create_queue_backend(&settings)?;
    backend.connect().await?;
    tracing::info!(backend = %backend.backend_type(), "Queue backend connected");

    let manager = Arc::new(QueueManager::new(backend));
    let queue = manager.get_queue(&settings.consumer.queue_name).await?;

    let consumer = Arc::new(Consumer::new(
        queue,
        Arc::new(LoggingHandler),
        settings.consumer.consumer_options(),
    ));
    consumer.start().await?;

    shutdown_signal().await;

    let result = GracefulShutdown::new(vec![consumer], manager)
        .execute("signal")
        .await;
    if !result.success {
        tracing::warn!("Shutdown finished with errors");
    }

    match encode_metrics() {
        Ok(snapshot) => tracing::debug!(metrics = %snapshot, "Final metrics snapshot"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
