//! fxbridge API Server
//!
//! HTTP API, webhook intake, and WebSocket price streaming in one process.
//! The fan-out subscriber holds a single pub/sub subscription per process.

use dotenvy::dotenv;
use fxbridge::core::http::start_server;
use fxbridge::logging;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    logging::init_logging();

    let port = fxbridge::config::get_port();
    let env = fxbridge::config::get_environment();
    info!("Starting fxbridge API Server");
    info!(environment = %env, "Environment");
    info!(port = port, "HTTP Server: http://0.0.0.0:{}", port);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(port).await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("API server started, waiting for shutdown signal...");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down API server...");
            info!("API server stopped");
        }
        _ = server_handle => {
            error!("HTTP server stopped");
        }
    }

    Ok(())
}
