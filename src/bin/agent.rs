//! fxbridge Agent
//!
//! Runs next to the user's trading terminal and bridges it to the backend:
//! pushes prices every second, heartbeats every five minutes, and polls for
//! jobs every thirty seconds. Pair first (POST /agents/pair), then run with
//! AGENT_ID, AGENT_KEY, and API_URL set.

use dotenvy::dotenv;
use fxbridge::agent::{AgentConfig, AgentRuntime, ApiClient, SimTerminal, TerminalBridge};
use fxbridge::logging;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    logging::init_logging();

    let config = AgentConfig::from_env().map_err(|e| {
        error!(error = %e, "Agent configuration error");
        e
    })?;

    info!("Starting fxbridge Agent");
    info!(agent_id = %config.agent_id, "Agent ID");
    info!(api_url = %config.api_url, "API URL");

    let client = Arc::new(ApiClient::new(&config)?);
    let terminal: Arc<dyn TerminalBridge> = Arc::new(SimTerminal::new());
    info!(symbols = ?terminal.symbols(), "Terminal ready");

    let runtime = AgentRuntime::new(client, terminal);
    let handles = runtime.start();

    info!("Agent started: price push 1s, heartbeat 300s, job poll 30s");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down agent...");
            for handle in handles {
                handle.abort();
            }
            info!("Agent stopped");
        }
    }

    Ok(())
}
