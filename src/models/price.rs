//! Price tick payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bid/ask quote for one instrument. Ephemeral: cached briefly,
/// published to live subscribers, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub instrument: String,
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(instrument: impl Into<String>, bid: f64, ask: f64, time: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            bid,
            ask,
            time,
        }
    }
}
