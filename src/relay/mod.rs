//! Price Relay: agent tick intake
//!
//! Every tick is written through the short-TTL cache (so late subscribers
//! get the last value) and published on the instrument channel (so live
//! subscribers get it now). Ticks are ephemeral; a gap is just a gap.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::cache::{CacheError, TickCache};
use crate::models::PriceTick;

pub struct PriceRelay {
    cache: Arc<dyn TickCache>,
}

impl PriceRelay {
    pub fn new(cache: Arc<dyn TickCache>) -> Self {
        Self { cache }
    }

    /// Cache and publish one tick. Last write wins per instrument; the
    /// relay does not reorder out-of-order arrivals.
    pub async fn publish_tick(
        &self,
        instrument: &str,
        bid: f64,
        ask: f64,
        time: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let tick = PriceTick::new(instrument, bid, ask, time);
        self.cache.put_tick(&tick).await
    }

    /// Latest cached tick, if the TTL has not lapsed. Pure read.
    pub async fn get_cached_tick(&self, instrument: &str) -> Result<Option<PriceTick>, CacheError> {
        self.cache.get_tick(instrument).await
    }
}
