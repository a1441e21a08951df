//! Redis connection management for the Redis queue backend
//!
//! - `RedisPool`: multiplexed command connections plus dedicated
//!   connections for blocking pops
//! - `RedisPoolExt`: typed list, sorted-set and set commands

mod pool;

pub use pool::{RedisPool, RedisPoolExt};
