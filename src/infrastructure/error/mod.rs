//! Unified error type for queue operations.
//!
//! Transport and storage failures are always surfaced to the caller.
//! An empty queue or an elapsed pop timeout is never an error: those
//! are reported as `Ok(None)` by the pop operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend is temporarily unavailable (circuit open, not connected, ...)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Only raised by backends that enforce `QueueOptions::max_length` at push time
    #[error("Queue full: {name} (max length: {max_length})")]
    QueueFull { name: String, max_length: u64 },

    #[error("Queue closed: {0}")]
    Closed(String),

    #[error("Consumer is already running")]
    AlreadyRunning,

    /// A batch publish stopped at this message
    #[error("Failed to publish message {id}: {source}")]
    Publish {
        id: String,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    /// Whether the error came from the broker transport rather than from
    /// the caller or the queue state.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QueueError::Redis(_) | QueueError::Amqp(_) | QueueError::Unavailable(_) | QueueError::Timeout(_)
        )
    }

    /// ID of the message that failed inside a batch publish.
    pub fn failed_message_id(&self) -> Option<&str> {
        match self {
            QueueError::Publish { id, .. } => Some(id),
            _ => None,
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_names_message() {
        let err = QueueError::Publish {
            id: "m2".to_string(),
            source: Box::new(QueueError::Unavailable("down".to_string())),
        };

        assert_eq!(err.failed_message_id(), Some("m2"));
        let text = err.to_string();
        assert!(text.contains("m2"));
        assert!(text.contains("down"));
    }

    #[test]
    fn test_transport_classification() {
        assert!(QueueError::Unavailable("x".into()).is_transport());
        assert!(QueueError::Timeout("x".into()).is_transport());
        assert!(!QueueError::AlreadyRunning.is_transport());
        assert!(!QueueError::Closed("orders".into()).is_transport());
    }

    #[test]
    fn test_queue_full_display() {
        let err = QueueError::QueueFull {
            name: "orders".to_string(),
            max_length: 10,
        };
        assert_eq!(err.to_string(), "Queue full: orders (max length: 10)");
    }
}
