//! Paired agent records and derived liveness

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Heartbeat age below this is `online`
const ONLINE_WITHIN_MINUTES: i64 = 6;
/// Heartbeat age below this (but past online) is `degraded`
const DEGRADED_WITHIN_MINUTES: i64 = 10;

/// Connection quality derived from heartbeat age at read time.
/// Never stored: the timestamp is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Degraded,
    Offline,
}

impl Liveness {
    /// Derive liveness from the last heartbeat timestamp
    pub fn derive(last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_heartbeat {
            None => Liveness::Offline,
            Some(hb) => {
                let age = now - hb;
                if age < Duration::minutes(ONLINE_WITHIN_MINUTES) {
                    Liveness::Online
                } else if age < Duration::minutes(DEGRADED_WITHIN_MINUTES) {
                    Liveness::Degraded
                } else {
                    Liveness::Offline
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Online => "online",
            Liveness::Degraded => "degraded",
            Liveness::Offline => "offline",
        }
    }
}

/// A paired desktop agent. The raw pairing key is never stored;
/// only its hash and a short display prefix survive pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pairing_key_hash: String,
    pub pairing_key_prefix: String,
    pub is_connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: String,
    pub metrics: Option<Value>,
}

impl AgentRecord {
    pub fn liveness(&self, now: DateTime<Utc>) -> Liveness {
        Liveness::derive(self.last_heartbeat, now)
    }

    /// Whether the agent is fresh enough to be handed work.
    /// Matches the bridge precondition: connected and heartbeat younger
    /// than the degraded window.
    pub fn is_reachable(&self, now: DateTime<Utc>) -> bool {
        self.is_connected && self.liveness(now) != Liveness::Offline
    }
}
