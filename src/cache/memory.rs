//! In-memory tick cache for tests and cache-less development
//!
//! TTLs are tracked against the tokio clock so time-sensitive tests can
//! drive them with `tokio::time::pause`.

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::models::PriceTick;

use super::{tick_key, CacheError, TickCache, TickStream, TICK_TTL};

pub struct MemoryTickCache {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
    publisher: broadcast::Sender<PriceTick>,
}

impl MemoryTickCache {
    pub fn new() -> Self {
        let (publisher, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            publisher,
        }
    }

    async fn read_live(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryTickCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TickCache for MemoryTickCache {
    async fn put_tick(&self, tick: &PriceTick) -> Result<(), CacheError> {
        let value =
            serde_json::to_value(tick).map_err(|e| CacheError::Backend(e.to_string()))?;
        self.entries
            .lock()
            .await
            .insert(tick_key(&tick.instrument), (value, Instant::now() + TICK_TTL));
        // No receivers is fine: nobody is watching yet
        let _ = self.publisher.send(tick.clone());
        Ok(())
    }

    async fn get_tick(&self, instrument: &str) -> Result<Option<PriceTick>, CacheError> {
        match self.read_live(&tick_key(instrument)).await {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn subscribe_ticks(&self) -> Result<TickStream, CacheError> {
        let rx = self.publisher.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => return Some((tick, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.read_live(key).await)
    }

    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }
}
