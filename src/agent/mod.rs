//! Desktop agent: bridges a local trading terminal to the backend
//!
//! Three independent loops keep the bridge alive: price pushes (~1 s),
//! heartbeats (~300 s), and job polling (~30 s). A blocked job execution
//! never starves price delivery or heartbeats.

pub mod client;
pub mod runner;
pub mod terminal;

use std::env;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub use client::{ApiClient, ClaimedJob, ClientError};
pub use runner::AgentRuntime;
pub use terminal::{SimTerminal, TerminalBridge, TerminalError};

#[derive(Debug, Error)]
pub enum AgentConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, String),
}

/// Agent credentials and backend address, from the environment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: Uuid,
    pub agent_key: String,
    pub api_url: Url,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, AgentConfigError> {
        let agent_id = env::var("AGENT_ID").map_err(|_| AgentConfigError::Missing("AGENT_ID"))?;
        let agent_id = Uuid::parse_str(&agent_id)
            .map_err(|e| AgentConfigError::Invalid("AGENT_ID", e.to_string()))?;

        let agent_key =
            env::var("AGENT_KEY").map_err(|_| AgentConfigError::Missing("AGENT_KEY"))?;

        let api_url =
            env::var("API_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let api_url = Url::parse(&api_url)
            .map_err(|e| AgentConfigError::Invalid("API_URL", e.to_string()))?;

        Ok(Self {
            agent_id,
            agent_key,
            api_url,
        })
    }
}
