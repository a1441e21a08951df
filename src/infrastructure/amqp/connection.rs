//! The single AMQP connection owned by an AMQP backend.
//!
//! Queues never see the connection itself, only channels created from it.
//! Closing a queue closes its channel; only the backend closes the connection.

use std::sync::Arc;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;

use crate::config::AmqpConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::resilience::{
    retry_with_backoff, BackoffConfig, CircuitBreaker, CircuitBreakerStats, ConnectionHealth,
    HealthStats, HealthStatus,
};

const BACKEND: &str = "amqp";

pub struct AmqpConnection {
    connection: RwLock<Option<Arc<Connection>>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<ConnectionHealth>,
    config: AmqpConfig,
}

impl AmqpConnection {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            connection: RwLock::new(None),
            circuit_breaker: Arc::new(CircuitBreaker::new(BACKEND)),
            health: Arc::new(ConnectionHealth::new(BACKEND)),
            config,
        }
    }

    /// Open the connection, retrying with exponential backoff. A no-op when
    /// already connected.
    pub async fn connect(&self) -> QueueResult<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let backoff = BackoffConfig {
            initial_delay_ms: self.config.backoff_initial_delay_ms,
            max_delay_ms: self.config.backoff_max_delay_ms,
            ..BackoffConfig::default()
        };

        let connection = retry_with_backoff("amqp", self.config.connect_attempts, backoff, move || async move {
            self.health.set_reconnecting();
            self.open().await
        })
        .await?;

        *self.connection.write().await = Some(Arc::new(connection));
        self.health.set_connected();
        tracing::info!(host = %self.config.host, vhost = %self.config.vhost, "AMQP connection established");
        Ok(())
    }

    async fn open(&self) -> QueueResult<Connection> {
        let url = self.config.connection_url();
        let connecting = Connection::connect(&url, ConnectionProperties::default());

        match tokio::time::timeout(self.config.connect_timeout(), connecting).await {
            Ok(Ok(connection)) => {
                self.circuit_breaker.record_success();
                Ok(connection)
            }
            Ok(Err(e)) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to AMQP broker");
                Err(e.into())
            }
            Err(_) => {
                self.circuit_breaker.record_failure();
                Err(QueueError::Timeout("amqp connect".to_string()))
            }
        }
    }

    /// Open a new channel on the shared connection.
    pub async fn create_channel(&self) -> QueueResult<Channel> {
        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(QueueError::Unavailable("AMQP circuit breaker is open".to_string()));
        }

        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or_else(|| QueueError::Unavailable("AMQP connection is not open".to_string()))?;

        if !connection.status().connected() {
            self.health.set_reconnecting();
            return Err(QueueError::Unavailable("AMQP connection was lost".to_string()));
        }

        match connection.create_channel().await {
            Ok(channel) => {
                self.circuit_breaker.record_success();
                Ok(channel)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                QueueMetrics::record_error(BACKEND, "create_channel");
                Err(e.into())
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.connection.read().await.as_ref() {
            Some(connection) => connection.status().connected(),
            None => false,
        }
    }

    /// Liveness is the connection status reported by the client.
    pub async fn health_check(&self) -> QueueResult<()> {
        if self.is_connected().await {
            return Ok(());
        }
        if self.health.status() == HealthStatus::Healthy {
            self.health.set_reconnecting();
        }
        Err(QueueError::Unavailable("AMQP connection is not open".to_string()))
    }

    /// Close the connection. Channels created from it close with it.
    pub async fn close(&self) -> QueueResult<()> {
        let connection = self.connection.write().await.take();
        self.health.set_disconnected();

        if let Some(connection) = connection {
            if connection.status().connected() {
                connection.close(200, "OK").await?;
            }
            tracing::info!("AMQP connection closed");
        }
        Ok(())
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn health_stats(&self) -> HealthStats {
        self.health.stats()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> AmqpConfig {
        AmqpConfig {
            port: 1,
            host: "127.0.0.1".to_string(),
            connect_timeout_ms: 200,
            connect_attempts: 1,
            ..AmqpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_channel_requires_connection() {
        let connection = AmqpConnection::new(unreachable());

        assert!(!connection.is_connected().await);
        let err = connection.create_channel().await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert!(connection.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let connection = AmqpConnection::new(unreachable());

        assert!(connection.connect().await.is_err());
        assert!(!connection.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_ok() {
        let connection = AmqpConnection::new(unreachable());

        connection.close().await.unwrap();
        assert_eq!(connection.health_status(), HealthStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_shows_in_stats() {
        let connection = AmqpConnection::new(unreachable());
        assert!(connection.connect().await.is_err());

        let health = connection.health_stats();
        assert_ne!(health.status, HealthStatus::Healthy);
        assert_eq!(health.last_connected_ms, 0);
        assert!(health.reconnection_attempts >= 1);
        assert!(connection.circuit_stats().changed_at_ms > 0);
    }
}
