mod settings;

pub use settings::{AmqpConfig, ConsumerConfig, OtelConfig, QueueConfig, RedisConfig, Settings};
