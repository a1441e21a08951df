//! Redis connection pool for the list/sorted-set queue backend.
//!
//! Commands share a small set of multiplexed connections picked round-robin.
//! `BLPOP` parks the connection it runs on, which would stall every task
//! sharing a multiplexed connection, so blocking pops check out a dedicated
//! connection from a separate idle pool instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisError};
use tokio::sync::{Mutex, RwLock};

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::resilience::{
    retry_with_backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitState, ConnectionHealth, HealthStats, HealthStatus, FAR_FUTURE,
};

const BACKEND: &str = "redis";

/// Response timeout for blocking connections. The real bound on a blocking
/// pop is the caller's timeout plus the read timeout.
const BLOCKING_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3600);

struct IdleConnection {
    conn: MultiplexedConnection,
    idle_since: Instant,
}

/// Redis connection pool shared by every queue of one Redis backend.
///
/// The pool owns its connections. Queues hold an `Arc<RedisPool>` and never
/// close it; only the backend's `disconnect` does.
pub struct RedisPool {
    client: Client,

    /// Multiplexed command connections, empty until connected
    connections: RwLock<Vec<MultiplexedConnection>>,

    /// Round-robin cursor over `connections`
    next: AtomicUsize,

    /// Idle dedicated connections for blocking pops
    blocking: Mutex<Vec<IdleConnection>>,

    circuit_breaker: Arc<CircuitBreaker>,

    health: Arc<ConnectionHealth>,

    config: RedisConfig,
}

impl RedisPool {
    /// Create a pool. No connection is opened until `connect` or the first command.
    pub fn new(config: RedisConfig) -> QueueResult<Self> {
        let client = Client::open(config.connection_url())?;
        let circuit_breaker = CircuitBreaker::with_config(
            BACKEND,
            CircuitBreakerConfig {
                failures_to_open: config.circuit_breaker_failure_threshold,
                successes_to_close: config.circuit_breaker_success_threshold,
                open_for: Duration::from_secs(config.circuit_breaker_reset_timeout_seconds),
            },
        );

        Ok(Self {
            client,
            connections: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            blocking: Mutex::new(Vec::new()),
            circuit_breaker: Arc::new(circuit_breaker),
            health: Arc::new(ConnectionHealth::new(BACKEND)),
            config,
        })
    }

    /// Open the command connections, retrying with exponential backoff.
    pub async fn connect(&self) -> QueueResult<()> {
        let backoff = BackoffConfig {
            initial_delay_ms: self.config.backoff_initial_delay_ms,
            max_delay_ms: self.config.backoff_max_delay_ms,
            ..BackoffConfig::default()
        };

        retry_with_backoff("redis", self.config.connect_attempts, backoff, move || async move {
            let mut connections = self.connections.write().await;
            if !connections.is_empty() {
                return Ok(());
            }
            self.health.set_reconnecting();
            *connections = self.open_connections().await?;
            Ok::<(), QueueError>(())
        })
        .await
    }

    /// Drop every connection. Later commands reconnect lazily.
    pub async fn disconnect(&self) {
        self.connections.write().await.clear();
        self.blocking.lock().await.clear();
        self.health.set_disconnected();
        tracing::info!("Redis pool disconnected");
    }

    async fn open_connections(&self) -> QueueResult<Vec<MultiplexedConnection>> {
        let size = self.config.pool_size.max(1);
        let mut opened = Vec::with_capacity(size);
        for _ in 0..size {
            opened.push(self.open_connection(self.config.read_timeout()).await?);
        }

        let mut first = opened[0].clone();
        let pong: RedisResultOrTimeout<String> =
            tokio::time::timeout(self.config.read_timeout(), redis::cmd("PING").query_async(&mut first)).await;
        match pong {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.circuit_breaker.record_failure();
                return Err(e.into());
            }
            Err(_) => {
                self.circuit_breaker.record_failure();
                return Err(QueueError::Timeout("redis PING".to_string()));
            }
        }

        self.circuit_breaker.record_success();
        self.health.set_connected();
        tracing::info!(pool_size = size, "Redis pool connections established");
        Ok(opened)
    }

    async fn open_connection(&self, response_timeout: Duration) -> QueueResult<MultiplexedConnection> {
        match self
            .client
            .get_multiplexed_async_connection_with_timeouts(response_timeout, self.config.connect_timeout())
            .await
        {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(e.into())
            }
        }
    }

    fn check_circuit(&self) -> QueueResult<()> {
        if self.circuit_breaker.allow_request() {
            return Ok(());
        }
        self.health.set_circuit_open();
        Err(QueueError::Unavailable("Redis circuit breaker is open".to_string()))
    }

    /// Get a command connection, connecting on first use or after a drop.
    async fn get_connection(&self) -> QueueResult<MultiplexedConnection> {
        self.check_circuit()?;

        {
            let connections = self.connections.read().await;
            if !connections.is_empty() {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
                return Ok(connections[index].clone());
            }
        }

        let mut connections = self.connections.write().await;
        // Another task may have reconnected while we waited for the lock
        if connections.is_empty() {
            self.health.set_reconnecting();
            *connections = self.open_connections().await?;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(connections[index].clone())
    }

    /// Run one command with circuit breaker protection and a deadline.
    async fn execute<T: FromRedisValue + Send>(
        &self,
        operation: &'static str,
        limit: Duration,
        cmd: Cmd,
    ) -> QueueResult<T> {
        let mut conn = self.get_connection().await?;

        let result: RedisResultOrTimeout<T> = tokio::time::timeout(limit, cmd.query_async(&mut conn)).await;
        match result {
            Ok(Ok(value)) => {
                self.circuit_breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_command_error(operation, &e).await;
                Err(e.into())
            }
            Err(_) => {
                self.circuit_breaker.record_failure();
                QueueMetrics::record_error(BACKEND, operation);
                Err(QueueError::Timeout(format!("redis {}", operation)))
            }
        }
    }

    async fn on_command_error(&self, operation: &'static str, e: &RedisError) {
        if e.is_connection_dropped() || e.is_io_error() {
            // Clear the connections so the next call reconnects
            self.connections.write().await.clear();
            self.health.set_reconnecting();
        }
        self.circuit_breaker.record_failure();
        QueueMetrics::record_error(BACKEND, operation);
        tracing::warn!(operation, error = %e, "Redis command failed");
    }

    async fn read<T: FromRedisValue + Send>(&self, operation: &'static str, cmd: Cmd) -> QueueResult<T> {
        self.execute(operation, self.config.read_timeout(), cmd).await
    }

    async fn write<T: FromRedisValue + Send>(&self, operation: &'static str, cmd: Cmd) -> QueueResult<T> {
        self.execute(operation, self.config.write_timeout(), cmd).await
    }

    async fn checkout_blocking(&self) -> QueueResult<MultiplexedConnection> {
        {
            let mut idle = self.blocking.lock().await;
            let idle_timeout = self.config.idle_timeout();
            idle.retain(|entry| entry.idle_since.elapsed() < idle_timeout);
            if let Some(entry) = idle.pop() {
                return Ok(entry.conn);
            }
        }
        self.open_connection(BLOCKING_RESPONSE_TIMEOUT).await
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < self.config.pool_size.max(1) {
            idle.push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
    }

    /// `BLPOP` on a dedicated connection, waiting at most `timeout`.
    ///
    /// Not cancel-safe: dropping the future after Redis has popped the
    /// element loses it together with the connection.
    pub async fn blpop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>> {
        self.check_circuit()?;
        let mut conn = self.checkout_blocking().await?;

        // Fractional timeouts need Redis 6; zero would block forever
        let mut cmd = redis::cmd("BLPOP");
        let timeout = timeout.min(FAR_FUTURE);
        cmd.arg(key).arg(timeout.as_secs_f64().max(0.001));

        let limit = timeout.saturating_add(self.config.read_timeout());
        let result: RedisResultOrTimeout<Option<(String, String)>> =
            tokio::time::timeout(limit, cmd.query_async(&mut conn)).await;

        match result {
            Ok(Ok(reply)) => {
                self.circuit_breaker.record_success();
                self.checkin_blocking(conn).await;
                Ok(reply.map(|(_, value)| value))
            }
            Ok(Err(e)) => {
                self.on_command_error("blpop", &e).await;
                Err(e.into())
            }
            Err(_) => {
                // The reply may still arrive on this connection; discard it
                self.circuit_breaker.record_failure();
                QueueMetrics::record_error(BACKEND, "blpop");
                Err(QueueError::Timeout("redis blpop".to_string()))
            }
        }
    }

    /// Liveness check.
    pub async fn ping(&self) -> QueueResult<()> {
        let _: String = self.read("ping", redis::cmd("PING")).await?;
        Ok(())
    }

    /// Whether the command connections are up and the circuit is closed.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub fn health_stats(&self) -> HealthStats {
        self.health.stats()
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }
}

type RedisResultOrTimeout<T> = Result<redis::RedisResult<T>, tokio::time::error::Elapsed>;

/// Typed Redis commands used by the queue backend.
#[async_trait::async_trait]
pub trait RedisPoolExt {
    // List operations (ready messages)

    /// Append to a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> QueueResult<u64>;

    /// Non-blocking pop from the head of a list.
    async fn lpop(&self, key: &str) -> QueueResult<Option<String>>;

    async fn llen(&self, key: &str) -> QueueResult<u64>;

    async fn lindex(&self, key: &str, index: i64) -> QueueResult<Option<String>>;

    // Sorted set operations (delayed messages)

    async fn zadd(&self, key: &str, score: f64, member: &str) -> QueueResult<()>;

    /// Remove a member, returning how many were removed (the claim result).
    async fn zrem(&self, key: &str, member: &str) -> QueueResult<u64>;

    async fn zcard(&self, key: &str) -> QueueResult<u64>;

    /// Members with score <= `max`, lowest score first, at most `count`.
    async fn zrangebyscore_limit(&self, key: &str, max: f64, count: usize) -> QueueResult<Vec<String>>;

    // Set operations (queue registry)

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<()>;

    async fn srem(&self, key: &str, member: &str) -> QueueResult<()>;

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>>;

    // Key operations

    /// Delete several keys in one round trip.
    async fn del_many(&self, keys: &[String]) -> QueueResult<()>;
}

#[async_trait::async_trait]
impl RedisPoolExt for RedisPool {
    async fn rpush(&self, key: &str, value: &str) -> QueueResult<u64> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.write("rpush", cmd).await
    }

    async fn lpop(&self, key: &str) -> QueueResult<Option<String>> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(key);
        self.write("lpop", cmd).await
    }

    async fn llen(&self, key: &str) -> QueueResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.read("llen", cmd).await
    }

    async fn lindex(&self, key: &str, index: i64) -> QueueResult<Option<String>> {
        let mut cmd = redis::cmd("LINDEX");
        cmd.arg(key).arg(index);
        self.read("lindex", cmd).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> QueueResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        let _: i64 = self.write("zadd", cmd).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> QueueResult<u64> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(member);
        self.write("zrem", cmd).await
    }

    async fn zcard(&self, key: &str) -> QueueResult<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.read("zcard", cmd).await
    }

    async fn zrangebyscore_limit(&self, key: &str, max: f64, count: usize) -> QueueResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg("-inf").arg(max).arg("LIMIT").arg(0).arg(count);
        self.read("zrangebyscore", cmd).await
    }

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<()> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let _: i64 = self.write("sadd", cmd).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> QueueResult<()> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let _: i64 = self.write("srem", cmd).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.read("smembers", cmd).await
    }

    async fn del_many(&self, keys: &[String]) -> QueueResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let _: i64 = self.write("del", cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RedisConfig {
        RedisConfig {
            url: Some("redis://127.0.0.1:1/0".to_string()),
            connect_timeout_ms: 50,
            connect_attempts: 1,
            circuit_breaker_failure_threshold: 1,
            ..RedisConfig::default()
        }
    }

    #[test]
    fn test_pool_starts_unhealthy() {
        let pool = RedisPool::new(config()).unwrap();
        assert!(!pool.is_healthy());
        assert_eq!(pool.health_status(), HealthStatus::Reconnecting);
        assert_eq!(pool.prefix(), "ara:mq");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let cfg = RedisConfig {
            url: Some("not a url".to_string()),
            ..RedisConfig::default()
        };
        assert!(RedisPool::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_opens_circuit() {
        let pool = RedisPool::new(config()).unwrap();

        assert!(pool.connect().await.is_err());
        assert_eq!(pool.circuit_state(), CircuitState::Open);

        let circuit = pool.circuit_stats();
        assert_eq!(circuit.state, CircuitState::Open);
        assert!(circuit.changed_at_ms > 0);
        assert_eq!(pool.health_stats().last_connected_ms, 0);

        let err = pool.llen("ara:mq:orders").await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert_eq!(pool.health_status(), HealthStatus::CircuitOpen);
    }
}
