//! Binary entry point for the Waypoint orchestrator server.

use waypoint_core::config::OrchestratorConfig;
use waypoint_server::{init_tracing, start_server, ServerConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4117;

#[tokio::main]
async fn main() {
    init_tracing();

    let orchestrator = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let host = std::env::var("WAYPOINT_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("WAYPOINT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    match start_server(ServerConfig {
        host,
        port,
        orchestrator,
    })
    .await
    {
        Ok(addr) => {
            tracing::info!("Waypoint orchestrator ready at http://{}/api/mcp", addr);
        }
        Err(e) => {
            eprintln!("failed to start server: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Waypoint orchestrator shutting down");
}
