//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `amqp`: AMQP broker connection
//! - `config`: Application configuration and settings
//! - `error`: Unified error types
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: Redis connection pool for list and sorted-set operations
//! - `resilience`: Circuit breaker, backoff and connection health

pub mod amqp;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
pub mod resilience;
