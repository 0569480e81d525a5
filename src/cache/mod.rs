//! Tick cache and pub/sub seam
//!
//! The cache serves two roles for every tick: a short-TTL "last value" read
//! for late subscribers, and a per-instrument publish for live subscribers.
//! A generic JSON kv surface covers response caching (candles). Redis backs
//! production; an in-memory implementation backs tests and development.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::models::PriceTick;

pub use memory::MemoryTickCache;
pub use redis::RedisTickCache;

/// How long a cached tick stays readable
pub const TICK_TTL: Duration = Duration::from_secs(10);

/// Cache key for the latest tick of an instrument
pub fn tick_key(instrument: &str) -> String {
    format!("price:{}", instrument)
}

/// Pub/sub channel for an instrument's tick stream
pub fn tick_channel(instrument: &str) -> String {
    format!("prices:{}", instrument)
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type TickStream = Pin<Box<dyn Stream<Item = PriceTick> + Send>>;

#[async_trait]
pub trait TickCache: Send + Sync {
    /// Cache the tick under `price:{instrument}` with [`TICK_TTL`] and
    /// publish it on `prices:{instrument}`. Both writes happen every time.
    async fn put_tick(&self, tick: &PriceTick) -> Result<(), CacheError>;

    /// Latest cached tick, `None` once the TTL has lapsed
    async fn get_tick(&self, instrument: &str) -> Result<Option<PriceTick>, CacheError>;

    /// Subscribe to tick publishes across all instruments.
    /// Each call opens an independent subscription; dropping the stream
    /// releases it.
    async fn subscribe_ticks(&self) -> Result<TickStream, CacheError>;

    async fn get_json(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError>;
}
