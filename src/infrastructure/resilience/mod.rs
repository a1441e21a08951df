//! Connection resilience shared by the broker-backed queues
//!
//! - `CircuitBreaker`: stops hammering a broker that keeps failing
//! - `ExponentialBackoff`: delays between connection attempts
//! - `ConnectionHealth`: tracks connection status for liveness checks
//! - `deadline_after`: overflow-safe deadlines for pops and handler budgets

mod backoff;
mod circuit_breaker;
mod health;

pub use backoff::{retry_with_backoff, BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use health::{ConnectionHealth, HealthStats, HealthStatus};

use std::time::Duration;

/// Cap on any wait or release time, about thirty years
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `now + after`, with `after` capped at `FAR_FUTURE` so it cannot overflow
pub(crate) fn deadline_after(after: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + after.min(FAR_FUTURE)
}
