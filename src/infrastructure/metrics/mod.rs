//! Prometheus metrics for the queue layer.
//!
//! - Queue metrics (pushed, popped, poison discards) labelled by backend
//! - Consumer metrics (handler outcomes, retries, exhausted drops, latency)
//! - Broker connection metrics (connection status, circuit breaker state)

mod helpers;

pub use helpers::{encode_metrics, BrokerMetrics, ConsumerMetrics, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_mq";

lazy_static! {
    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Messages successfully pushed
    pub static ref QUEUE_PUSHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_pushed_total", METRIC_PREFIX),
        "Total messages pushed to a queue",
        &["backend", "queue"]
    ).unwrap();

    /// Delayed messages pushed
    pub static ref QUEUE_DELAYED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_delayed_total", METRIC_PREFIX),
        "Total messages pushed with a delivery delay",
        &["backend", "queue"]
    ).unwrap();

    /// Messages removed by a pop
    pub static ref QUEUE_POPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_popped_total", METRIC_PREFIX),
        "Total messages retrieved from a queue",
        &["backend", "queue"]
    ).unwrap();

    /// Undeserializable messages acknowledged and discarded
    pub static ref QUEUE_POISON_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_poison_discarded_total", METRIC_PREFIX),
        "Total undeserializable messages discarded on receipt",
        &["backend", "queue"]
    ).unwrap();

    /// Queue operation failures
    pub static ref QUEUE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_errors_total", METRIC_PREFIX),
        "Total failed queue operations",
        &["backend", "operation"]
    ).unwrap();

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Handler invocations by outcome (success, failure, timeout)
    pub static ref HANDLER_INVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handler_invocations_total", METRIC_PREFIX),
        "Total message handler invocations by outcome",
        &["queue", "outcome"]
    ).unwrap();

    /// Retries scheduled after handler failure
    pub static ref HANDLER_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handler_retries_total", METRIC_PREFIX),
        "Total message retries scheduled",
        &["queue"]
    ).unwrap();

    /// Messages dropped, by reason (retries_exhausted, error_callback_failed, shutdown)
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Total messages dropped without successful handling",
        &["queue", "reason"]
    ).unwrap();

    /// Running worker tasks
    pub static ref ACTIVE_WORKERS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_active_workers", METRIC_PREFIX),
        "Number of running consumer workers",
        &["queue"]
    ).unwrap();

    /// Handler latency
    pub static ref HANDLER_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_handler_latency_seconds", METRIC_PREFIX),
        "Message handler latency in seconds",
        &["queue"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Broker connection status (1 = connected, 0 = disconnected)
    pub static ref BROKER_CONNECTION_STATUS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_broker_connection_status", METRIC_PREFIX),
        "Broker connection status (1=connected, 0=disconnected)",
        &["backend"]
    ).unwrap();

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref BROKER_CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_broker_circuit_breaker_state", METRIC_PREFIX),
        "Broker circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["backend"]
    ).unwrap();
}
