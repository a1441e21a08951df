//! AMQP-based queue backend using lapin.
//!
//! One durable broker queue per name, published through the default
//! exchange. Each `AmqpQueue` owns one channel; the backend owns the
//! connection.
//!
//! # Delivery semantics
//!
//! - Messages are acknowledged on receipt, so a message handed to a
//!   consumer is gone from the broker even if the handler later fails.
//! - A delivery whose body does not decode is still acknowledged and
//!   discarded (counted and logged at WARN, never retried).
//! - `delay` is only mapped onto the per-message `expiration` property.
//!   Without broker-side dead-letter routing an expired message is dropped,
//!   not delivered later, so delayed delivery is NOT provided here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Consumer};
use tokio::sync::Mutex;

use crate::error::{QueueError, QueueResult};
use crate::infrastructure::amqp::AmqpConnection;
use crate::metrics::QueueMetrics;
use crate::resilience::{deadline_after, FAR_FUTURE};

use super::backend::{BackendType, Queue, QueueBackend};
use super::message::{Message, QueueOptions};

const BACKEND: &str = "amqp";

const HEADER_RETRY_COUNT: &str = "retry_count";
const HEADER_MAX_RETRIES: &str = "max_retries";
const HEADER_PRIORITY: &str = "priority";

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP-based queue backend.
pub struct AmqpBackend {
    connection: Arc<AmqpConnection>,
    /// Names declared through this backend, for `list_queues`
    declared: DashSet<String>,
    default_options: QueueOptions,
}

impl AmqpBackend {
    pub fn new(connection: Arc<AmqpConnection>, default_options: QueueOptions) -> Self {
        Self {
            connection,
            declared: DashSet::new(),
            default_options,
        }
    }
}

#[async_trait]
impl QueueBackend for AmqpBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Amqp
    }

    async fn connect(&self) -> QueueResult<()> {
        self.connection.connect().await?;
        tracing::info!(backend = BACKEND, "Queue backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.connection.close().await
    }

    async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    async fn health_check(&self) -> QueueResult<()> {
        self.connection.health_check().await
    }

    async fn create_queue(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<dyn Queue>> {
        let channel = self.connection.create_channel().await?;
        declare(&channel, name, &options).await?;
        self.declared.insert(name.to_string());

        tracing::debug!(backend = BACKEND, queue = %name, "Queue declared");

        Ok(Arc::new(AmqpQueue {
            name: name.to_string(),
            connection: self.connection.clone(),
            channel: Mutex::new(channel),
            consumer: Mutex::new(None),
            options,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_queue(&self, name: &str) -> QueueResult<()> {
        let channel = self.connection.create_channel().await?;
        let deleted = channel.queue_delete(name, QueueDeleteOptions::default()).await;
        if let Err(e) = channel.close(200, "OK").await {
            tracing::debug!(backend = BACKEND, error = %e, "Failed to close temporary channel");
        }
        let purged = deleted?;

        self.declared.remove(name);
        tracing::debug!(backend = BACKEND, queue = %name, purged, "Queue deleted");
        Ok(())
    }

    /// Only names declared through this backend; the broker's full queue
    /// list is not reachable over AMQP.
    async fn list_queues(&self) -> QueueResult<Vec<String>> {
        let mut names: Vec<String> = self.declared.iter().map(|name| name.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn default_queue_options(&self) -> QueueOptions {
        self.default_options.clone()
    }
}

async fn declare(channel: &Channel, name: &str, options: &QueueOptions) -> QueueResult<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: options.durable,
                auto_delete: options.auto_delete,
                exclusive: options.exclusive,
                ..QueueDeclareOptions::default()
            },
            queue_arguments(options),
        )
        .await?;
    Ok(())
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(max_length) = options.max_length {
        arguments.insert("x-max-length".into(), AMQPValue::LongLongInt(max_length as i64));
    }
    if let Some(ttl) = options.message_ttl {
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl.as_millis() as i64));
    }
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.as_str().into()));
    }
    if let Some(routing_key) = &options.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    arguments
}

fn publish_properties(message: &Message) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.headers {
        headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }
    headers.insert(HEADER_RETRY_COUNT.into(), AMQPValue::LongLongInt(message.retry_count as i64));
    headers.insert(HEADER_MAX_RETRIES.into(), AMQPValue::LongLongInt(message.max_retries as i64));
    headers.insert(HEADER_PRIORITY.into(), AMQPValue::LongLongInt(message.priority as i64));

    let properties = BasicProperties::default()
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_content_type("application/json".into())
        .with_message_id(message.id.as_str().into())
        .with_headers(headers);

    if message.is_delayed() {
        properties.with_expiration(ShortString::from(message.delay.min(FAR_FUTURE).as_millis().to_string()))
    } else {
        properties
    }
}

fn header_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Decode a body and fold the protocol headers back into the message.
fn decode_message(data: &[u8], properties: &BasicProperties) -> Result<Message, serde_json::Error> {
    let mut message = Message::from_json(data)?;

    if let Some(headers) = properties.headers() {
        for (key, value) in headers.inner() {
            match key.as_str() {
                HEADER_RETRY_COUNT => {
                    if let Some(n) = header_int(value) {
                        message.retry_count = n.max(0) as u32;
                    }
                }
                HEADER_MAX_RETRIES => {
                    if let Some(n) = header_int(value) {
                        message.max_retries = n.max(0) as u32;
                    }
                }
                HEADER_PRIORITY => {
                    if let Some(n) = header_int(value) {
                        message.priority = n as i32;
                    }
                }
                other => {
                    if let AMQPValue::LongString(text) = value {
                        message
                            .headers
                            .insert(other.to_string(), String::from_utf8_lossy(text.as_bytes()).into_owned());
                    }
                }
            }
        }
    }

    Ok(message)
}

/// Handle onto one AMQP queue.
pub struct AmqpQueue {
    name: String,
    connection: Arc<AmqpConnection>,
    channel: Mutex<Channel>,
    /// Persistent subscription used by bounded-wait pops, opened on first use
    consumer: Mutex<Option<Consumer>>,
    options: QueueOptions,
    closed: AtomicBool,
}

impl AmqpQueue {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Current channel, reopened (and the queue re-declared) if the broker closed it.
    async fn channel(&self) -> QueueResult<Channel> {
        let mut channel = self.channel.lock().await;
        if !channel.status().connected() {
            let reopened = self.connection.create_channel().await?;
            declare(&reopened, &self.name, &self.options).await?;
            *channel = reopened;
            tracing::info!(backend = BACKEND, queue = %self.name, "Channel reopened");
        }
        Ok(channel.clone())
    }

    /// Ack on receipt, then decode. `None` means the delivery was poison and
    /// has been discarded.
    async fn accept(&self, delivery: Delivery) -> QueueResult<Option<Message>> {
        delivery.acker.ack(BasicAckOptions::default()).await?;

        match decode_message(&delivery.data, &delivery.properties) {
            Ok(message) => {
                QueueMetrics::record_popped(BACKEND, &self.name);
                Ok(Some(message))
            }
            Err(e) => {
                QueueMetrics::record_poison_discarded(BACKEND, &self.name);
                tracing::warn!(
                    backend = BACKEND,
                    queue = %self.name,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Discarded undecodable message"
                );
                Ok(None)
            }
        }
    }

    /// Non-blocking receive-and-acknowledge.
    async fn get_once(&self) -> QueueResult<Option<Message>> {
        let channel = self.channel().await?;
        loop {
            let Some(got) = channel
                .basic_get(&self.name, BasicGetOptions { no_ack: false })
                .await?
            else {
                return Ok(None);
            };
            if let Some(message) = self.accept(got.delivery).await? {
                return Ok(Some(message));
            }
        }
    }

    async fn open_consumer(&self) -> QueueResult<Consumer> {
        let channel = self.channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let tag = format!("ara-mq-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(&self.name, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        tracing::debug!(backend = BACKEND, queue = %self.name, consumer_tag = %tag, "Subscription opened");
        Ok(consumer)
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, mut message: Message) -> QueueResult<()> {
        self.ensure_open()?;
        message.stamp();

        let payload = message.to_json()?;
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                &self.name,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                publish_properties(&message),
            )
            .await?;
        confirm.await?;

        QueueMetrics::record_pushed(BACKEND, &self.name, message.is_delayed());
        tracing::debug!(backend = BACKEND, queue = %self.name, message_id = %message.id, "Message published");
        Ok(())
    }

    /// Non-blocking: the client has no bounded-wait `basic_get`.
    async fn pop(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        self.get_once().await
    }

    /// Waits on a persistent subscription (prefetch 1) until a delivery
    /// arrives or the timeout elapses.
    async fn pop_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        if timeout.is_zero() {
            return self.get_once().await;
        }

        let deadline = deadline_after(timeout);

        // Workers sharing this queue take turns on the subscription
        let Ok(mut slot) = tokio::time::timeout_at(deadline, self.consumer.lock()).await else {
            return Ok(None);
        };

        loop {
            // A subscription on a dead channel ends its stream and is cleared below
            if slot.is_none() {
                *slot = Some(self.open_consumer().await?);
            }
            let Some(consumer) = slot.as_mut() else {
                continue;
            };

            // Consumer buffers deliveries internally, so an elapsed wait loses nothing
            match tokio::time::timeout_at(deadline, consumer.next()).await {
                Err(_) => return Ok(None),
                Ok(Some(Ok(delivery))) => {
                    if let Some(message) = self.accept(delivery).await? {
                        return Ok(Some(message));
                    }
                }
                Ok(Some(Err(e))) => {
                    *slot = None;
                    QueueMetrics::record_error(BACKEND, "consume");
                    return Err(e.into());
                }
                Ok(None) => {
                    *slot = None;
                    return Err(QueueError::Unavailable(format!(
                        "subscription to {} was cancelled by the broker",
                        self.name
                    )));
                }
            }
        }
    }

    /// Receive then reject with requeue, so the message becomes visible again.
    async fn peek(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        let channel = self.channel().await?;

        let Some(got) = channel
            .basic_get(&self.name, BasicGetOptions { no_ack: false })
            .await?
        else {
            return Ok(None);
        };
        let delivery = got.delivery;

        let decoded = decode_message(&delivery.data, &delivery.properties);
        delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;

        Ok(Some(decoded?))
    }

    /// Broker-reported count from a passive declare. A delivery prefetched
    /// by the subscription but not yet acknowledged is not included.
    async fn size(&self) -> QueueResult<u64> {
        self.ensure_open()?;
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                &self.name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count() as u64)
    }

    async fn clear(&self) -> QueueResult<()> {
        self.ensure_open()?;
        let channel = self.channel().await?;
        let purged = channel.queue_purge(&self.name, QueuePurgeOptions::default()).await?;
        tracing::debug!(backend = BACKEND, queue = %self.name, purged, "Queue purged");
        Ok(())
    }

    /// Cancel the subscription and close this queue's channel. The
    /// connection is left to the backend.
    async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channel = self.channel.lock().await.clone();
        if let Some(consumer) = self.consumer.lock().await.take() {
            if let Err(e) = channel
                .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                .await
            {
                tracing::debug!(backend = BACKEND, queue = %self.name, error = %e, "Failed to cancel subscription");
            }
        }

        if channel.status().connected() {
            channel.close(200, "OK").await?;
        }
        tracing::debug!(backend = BACKEND, queue = %self.name, "Queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_arguments_from_options() {
        let options = QueueOptions {
            max_length: Some(100),
            message_ttl: Some(Duration::from_secs(60)),
            dead_letter_exchange: Some("dlx".to_string()),
            dead_letter_routing_key: Some("orders.dead".to_string()),
            ..QueueOptions::default()
        };

        let arguments = queue_arguments(&options);
        let inner = arguments.inner();

        assert_eq!(inner.len(), 4);
        assert_eq!(
            inner.get(&ShortString::from("x-max-length")),
            Some(&AMQPValue::LongLongInt(100))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
    }

    #[test]
    fn test_default_options_declare_no_arguments() {
        assert!(queue_arguments(&QueueOptions::default()).inner().is_empty());
    }

    #[test]
    fn test_publish_properties_carry_retry_headers() {
        let message = Message::new("m1", "x")
            .with_max_retries(3)
            .with_priority(7)
            .with_header("source", "chat")
            .with_delay(Duration::from_millis(1500));

        let properties = publish_properties(&message);

        assert_eq!(*properties.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(
            properties.expiration().as_ref().map(|e| e.as_str().to_string()),
            Some("1500".to_string())
        );

        let decoded = decode_message(message.to_json().unwrap().as_bytes(), &properties).unwrap();
        assert_eq!(decoded.max_retries, 3);
        assert_eq!(decoded.priority, 7);
        assert_eq!(decoded.header("source"), Some("chat"));
    }

    #[test]
    fn test_headers_override_body_counters() {
        let mut headers = FieldTable::default();
        headers.insert(HEADER_RETRY_COUNT.into(), AMQPValue::LongInt(2));
        let properties = BasicProperties::default().with_headers(headers);

        let body = Message::new("m1", "x").to_json().unwrap();
        let decoded = decode_message(body.as_bytes(), &properties).unwrap();

        assert_eq!(decoded.retry_count, 2);
    }

    #[test]
    fn test_undecodable_body_is_rejected() {
        assert!(decode_message(b"\x00\x01garbage", &BasicProperties::default()).is_err());
    }
}
