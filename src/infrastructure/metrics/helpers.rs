//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    ACTIVE_WORKERS, BROKER_CIRCUIT_BREAKER_STATE, BROKER_CONNECTION_STATUS, HANDLER_INVOCATIONS_TOTAL,
    HANDLER_LATENCY, HANDLER_RETRIES_TOTAL, MESSAGES_DROPPED_TOTAL, QUEUE_DELAYED_TOTAL,
    QUEUE_ERRORS_TOTAL, QUEUE_POISON_DISCARDED_TOTAL, QUEUE_POPPED_TOTAL, QUEUE_PUSHED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for queue operation metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_pushed(backend: &str, queue: &str, delayed: bool) {
        QUEUE_PUSHED_TOTAL.with_label_values(&[backend, queue]).inc();
        if delayed {
            QUEUE_DELAYED_TOTAL.with_label_values(&[backend, queue]).inc();
        }
    }

    pub fn record_popped(backend: &str, queue: &str) {
        QUEUE_POPPED_TOTAL.with_label_values(&[backend, queue]).inc();
    }

    pub fn record_poison_discarded(backend: &str, queue: &str) {
        QUEUE_POISON_DISCARDED_TOTAL
            .with_label_values(&[backend, queue])
            .inc();
    }

    pub fn record_error(backend: &str, operation: &str) {
        QUEUE_ERRORS_TOTAL.with_label_values(&[backend, operation]).inc();
    }
}

/// Helper struct for consumer engine metrics
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    pub fn record_success(queue: &str, latency_secs: f64) {
        HANDLER_INVOCATIONS_TOTAL
            .with_label_values(&[queue, "success"])
            .inc();
        HANDLER_LATENCY.with_label_values(&[queue]).observe(latency_secs);
    }

    pub fn record_failure(queue: &str, latency_secs: f64) {
        HANDLER_INVOCATIONS_TOTAL
            .with_label_values(&[queue, "failure"])
            .inc();
        HANDLER_LATENCY.with_label_values(&[queue]).observe(latency_secs);
    }

    pub fn record_timeout(queue: &str) {
        HANDLER_INVOCATIONS_TOTAL
            .with_label_values(&[queue, "timeout"])
            .inc();
    }

    pub fn record_retry(queue: &str) {
        HANDLER_RETRIES_TOTAL.with_label_values(&[queue]).inc();
    }

    pub fn record_dropped(queue: &str, reason: &str) {
        MESSAGES_DROPPED_TOTAL.with_label_values(&[queue, reason]).inc();
    }

    pub fn worker_started(queue: &str) {
        ACTIVE_WORKERS.with_label_values(&[queue]).inc();
    }

    pub fn worker_stopped(queue: &str) {
        ACTIVE_WORKERS.with_label_values(&[queue]).dec();
    }
}

/// Helper struct for broker connection metrics
pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn set_connected(backend: &str, connected: bool) {
        BROKER_CONNECTION_STATUS
            .with_label_values(&[backend])
            .set(if connected { 1 } else { 0 });
    }

    pub fn set_circuit_state(backend: &str, state: i64) {
        BROKER_CIRCUIT_BREAKER_STATE
            .with_label_values(&[backend])
            .set(state);
    }
}
