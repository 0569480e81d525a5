//! Agent pairing, authentication, and heartbeat tracking
//!
//! Pairing generates a 256-bit random secret, stores only its bcrypt hash
//! plus a short display prefix, and hands the raw key back exactly once.
//! Authentication verifies the presented key against the stored hash; there
//! is no plaintext-comparison path. Liveness is derived from heartbeat age
//! at read time, never stored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AgentRecord, Liveness};
use crate::store::{AgentStore, StoreError};

/// Non-secret display prefix length (characters of the encoded key)
const KEY_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid agent credentials")]
    Unauthorized,
    #[error("agent not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("key hashing failed: {0}")]
    Hash(String),
}

/// The one-time pairing response: the raw key is not recoverable later
#[derive(Debug, Clone)]
pub struct PairedAgent {
    pub agent_id: Uuid,
    pub pairing_key: String,
}

pub struct AgentSessions {
    store: Arc<dyn AgentStore>,
}

impl AgentSessions {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self { store }
    }

    /// Create a new agent for the user and return its raw pairing key
    pub async fn pair(&self, user_id: Uuid) -> Result<PairedAgent, SessionError> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let raw_key = URL_SAFE_NO_PAD.encode(secret);

        let key_for_hash = raw_key.clone();
        let hash = tokio::task::spawn_blocking(move || {
            bcrypt::hash(key_for_hash, bcrypt::DEFAULT_COST)
        })
        .await
        .map_err(|e| SessionError::Hash(e.to_string()))?
        .map_err(|e| SessionError::Hash(e.to_string()))?;

        let agent = AgentRecord {
            id: Uuid::new_v4(),
            user_id,
            pairing_key_hash: hash,
            pairing_key_prefix: raw_key[..KEY_PREFIX_LEN].to_string(),
            is_connected: false,
            last_heartbeat: None,
            status: "offline".to_string(),
            metrics: None,
        };
        let agent_id = agent.id;
        self.store.insert_agent(agent).await?;

        Ok(PairedAgent {
            agent_id,
            pairing_key: raw_key,
        })
    }

    /// Verify the presented key against the stored hash.
    /// A missing agent and a bad key are indistinguishable to the caller.
    pub async fn authenticate(
        &self,
        agent_id: Uuid,
        presented_key: &str,
    ) -> Result<AgentRecord, SessionError> {
        let agent = match self.store.get_agent(agent_id).await {
            Ok(agent) => agent,
            Err(StoreError::NotFound(_)) => return Err(SessionError::Unauthorized),
            Err(e) => return Err(e.into()),
        };

        let key = presented_key.to_string();
        let hash = agent.pairing_key_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(key, &hash))
            .await
            .map_err(|e| SessionError::Hash(e.to_string()))?
            .unwrap_or(false);

        if valid {
            Ok(agent)
        } else {
            Err(SessionError::Unauthorized)
        }
    }

    /// Unconditionally refresh the heartbeat timestamp and reported status
    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        status: &str,
        metrics: Value,
    ) -> Result<(), SessionError> {
        match self
            .store
            .record_heartbeat(agent_id, status, metrics, Utc::now())
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(SessionError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Agent record plus its derived liveness
    pub async fn status(&self, agent_id: Uuid) -> Result<(AgentRecord, Liveness), SessionError> {
        let agent = match self.store.get_agent(agent_id).await {
            Ok(agent) => agent,
            Err(StoreError::NotFound(_)) => return Err(SessionError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let liveness = agent.liveness(Utc::now());
        Ok((agent, liveness))
    }
}
