#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

use ssh_session_mcp::mcp::{SessionRegistry, Settings, SshSessionTools};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = Settings::from_env();
    let registry = SessionRegistry::new(settings);

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let endpoint_registry = registry.clone();
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(SshSessionTools::new(endpoint_registry.clone()))
            }),
        )
        .with(Tracing);

    info!("MCP Server with SSH session support is ready");
    info!("Use the ssh_open_session command to establish SSH connections");
    info!("Use the ssh_create_tunnel command to set up TCP tunnels");

    // Run the MCP server until interrupted, then close all sessions
    Server::new(TcpListener::bind(mcp_addr))
        .name("SSH Session MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            },
            None,
        )
        .await?;

    registry.shutdown().await;
    Ok(())
}
