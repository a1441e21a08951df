//! Queue message and queue provisioning options

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The unit of work carried by every backend.
///
/// `id` is caller-assigned and never checked for uniqueness; duplicates are
/// stored and delivered independently. `timestamp` stays `None` until the
/// message is pushed, at which point the backend stamps it.
///
/// # Example
///
/// ```rust,ignore
/// let message = Message::new("order-42", b"{\"total\":10}".to_vec())
///     .with_header("content-type", "application/json")
///     .with_delay(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    /// Opaque payload, base64 in the JSON encoding
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Failed delivery attempts so far
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub max_retries: u32,

    /// Not visible to consumers before push time + delay
    #[serde(default, rename = "delay_ms", with = "duration_millis")]
    pub delay: Duration,

    /// Higher is served first on backends that order natively; best-effort only
    #[serde(default)]
    pub priority: i32,
}

impl Message {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            headers: HashMap::new(),
            timestamp: None,
            retry_count: 0,
            max_retries: 0,
            delay: Duration::ZERO,
            priority: 0,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Stamp the push time unless the caller already set one.
    pub(crate) fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}

/// Options fixed when a queue is provisioned.
///
/// Backends honour what their storage can express: the AMQP backend maps
/// every field onto queue arguments, the Redis and memory backends only
/// enforce `max_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// `None` = unbounded
    pub max_length: Option<u64>,
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            max_length: None,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_message_new_defaults() {
        let msg = Message::new("m1", "hello");

        assert_eq!(msg.id, "m1");
        assert_eq!(msg.data, b"hello");
        assert!(msg.timestamp.is_none());
        assert_eq!(msg.retry_count, 0);
        assert!(!msg.is_delayed());
    }

    #[test]
    fn test_stamp_keeps_caller_timestamp() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let mut msg = Message::new("m1", "x").with_timestamp(earlier);
        msg.stamp();
        assert_eq!(msg.timestamp, Some(earlier));

        let mut msg = Message::new("m2", "x");
        msg.stamp();
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn test_json_wire_format() {
        let msg = Message::new("m1", "hello")
            .with_header("source", "chat")
            .with_delay(Duration::from_millis(1500))
            .with_priority(5);

        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");
        assert_eq!(json["delay_ms"], 1500);
        assert_eq!(json["headers"]["source"], "chat");
        assert_eq!(json["priority"], 5);
        assert!(json.get("timestamp").is_none());

        let decoded = Message::from_json(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let decoded = Message::from_json(br#"{"id":"m9","data":""}"#).unwrap();
        assert_eq!(decoded.id, "m9");
        assert!(decoded.data.is_empty());
        assert!(decoded.headers.is_empty());
        assert_eq!(decoded.delay, Duration::ZERO);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(Message::from_json(b"not json").is_err());
        assert!(Message::from_json(br#"{"id":"m1","data":"%%%"}"#).is_err());
    }

    #[test]
    fn test_queue_options_default() {
        let options = QueueOptions::default();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(options.max_length.is_none());
    }
}
