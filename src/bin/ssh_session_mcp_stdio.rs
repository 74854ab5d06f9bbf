#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use poem_mcpserver::McpServer;
use ssh_session_mcp::mcp::{SessionRegistry, Settings, SshSessionTools};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let registry = SessionRegistry::new(Settings::from_env());
    let tools = SshSessionTools::new(registry.clone());
    poem_mcpserver::stdio::stdio(McpServer::new().tools(tools)).await?;

    registry.shutdown().await;
    Ok(())
}
