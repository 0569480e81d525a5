//! Redis-backed tick cache and pub/sub

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;

use crate::config;
use crate::models::PriceTick;

use super::{tick_channel, tick_key, CacheError, TickCache, TickStream, TICK_TTL};

pub struct RedisTickCache {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisTickCache {
    pub async fn new() -> Result<Self, CacheError> {
        Self::connect(&config::get_redis_url()).await
    }

    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { client, manager })
    }
}

fn backend(e: redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

#[async_trait]
impl TickCache for RedisTickCache {
    async fn put_tick(&self, tick: &PriceTick) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(tick).map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut conn = self.manager.clone();

        let _: () = conn
            .set_ex(tick_key(&tick.instrument), &payload, TICK_TTL.as_secs())
            .await
            .map_err(backend)?;
        let _: () = conn
            .publish(tick_channel(&tick.instrument), &payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_tick(&self, instrument: &str) -> Result<Option<PriceTick>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(tick_key(instrument)).await.map_err(backend)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn subscribe_ticks(&self) -> Result<TickStream, CacheError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        pubsub
            .psubscribe(tick_channel("*"))
            .await
            .map_err(backend)?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str::<PriceTick>(&payload) {
                Ok(tick) => Some(tick),
                Err(e) => {
                    tracing::warn!(
                        channel = msg.get_channel_name(),
                        error = %e,
                        "Discarding malformed tick payload"
                    );
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await.map_err(backend)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(value).map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, payload, ttl.as_secs())
            .await
            .map_err(backend)?;
        Ok(())
    }
}
