use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::queue::QueueOptions;
use crate::consumer::ConsumerOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Backend selection and default queue provisioning options
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backend selector: "memory", "redis" or "amqp"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Blocking interval used by `Queue::pop`
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// 0 = unbounded
    #[serde(default)]
    pub max_length: u64,
    /// 0 = no per-message TTL
    #[serde(default)]
    pub message_ttl_ms: u64,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; takes precedence over host/port/password/db
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// Key prefix for queue lists, delayed sets and the queue registry
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    /// Number of multiplexed command connections plus the idle cap of the
    /// blocking-pop connection pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Idle blocking connections older than this are discarded on checkout
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout_seconds")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmqpConfig {
    /// Full connection URI; takes precedence over host/port/credentials
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_amqp_host")]
    pub host: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    #[serde(default = "default_amqp_username")]
    pub username: String,
    #[serde(default = "default_amqp_password")]
    pub password: String,
    #[serde(default = "default_amqp_vhost")]
    pub vhost: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Heartbeat negotiated with the broker; doubles as the idle timeout
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
}

/// Queue consumed by the worker binary and the default consumer options
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_queue")]
    pub queue_name: String,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_pop_timeout_ms() -> u64 {
    1000
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_prefix() -> String {
    "ara:mq".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    3000
}

fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout_seconds() -> u64 {
    30
}

fn default_backoff_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_max_delay_ms() -> u64 {
    30_000
}

fn default_amqp_host() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_amqp_username() -> String {
    "guest".to_string()
}

fn default_amqp_password() -> String {
    "guest".to_string()
}

fn default_amqp_vhost() -> String {
    "/".to_string()
}

fn default_heartbeat_secs() -> u16 {
    60
}

fn default_consumer_queue() -> String {
    "default".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_handler_timeout_secs() -> u64 {
    30
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-mq".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("queue.backend", "memory")?
            .set_default("log_level", "info")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // QUEUE__BACKEND, REDIS__HOST, AMQP__PASSWORD, CONSUMER__CONCURRENCY, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    /// Default options applied to queues created without explicit options
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
            max_length: (self.max_length > 0).then_some(self.max_length),
            message_ttl: (self.message_ttl_ms > 0).then(|| Duration::from_millis(self.message_ttl_ms)),
            dead_letter_exchange: self.dead_letter_exchange.clone().filter(|s| !s.is_empty()),
            dead_letter_routing_key: self.dead_letter_routing_key.clone().filter(|s| !s.is_empty()),
        }
    }
}

impl RedisConfig {
    /// Connection URL, built from the discrete fields when no URL is set
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_ref().filter(|u| !u.is_empty()) {
            return url.clone();
        }
        match self.password.as_ref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl AmqpConfig {
    /// Connection URI, built from the discrete fields when no URL is set
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_ref().filter(|u| !u.is_empty()) {
            return url.clone();
        }
        // The default vhost "/" must be percent-encoded in the URI path
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            self.username, self.password, self.host, self.port, vhost, self.heartbeat_secs
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ConsumerConfig {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            auto_ack: self.auto_ack,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            redis: RedisConfig::default(),
            amqp: AmqpConfig::default(),
            consumer: ConsumerConfig::default(),
            otel: OtelConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            pop_timeout_ms: default_pop_timeout_ms(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            max_length: 0,
            message_ttl_ms: 0,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            prefix: default_redis_prefix(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout_seconds(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
        }
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_amqp_host(),
            port: default_amqp_port(),
            username: default_amqp_username(),
            password: default_amqp_password(),
            vhost: default_amqp_vhost(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_attempts: default_connect_attempts(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_name: default_consumer_queue(),
            auto_ack: true,
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
