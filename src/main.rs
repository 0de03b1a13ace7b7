//! line-chat: A multi-client TCP chat server
//!
//! Clients speak a newline-delimited text protocol:
//! - `JOIN <nickname>` registers a nickname
//! - `MSG <text>` broadcasts to everyone else
//! - `LIST` shows who is online
//! - `QUIT` leaves
//!
//! Features:
//! - One task per connection, shared registry of joined users
//! - Dead peers pruned during broadcast
//! - Idle and write timeouts, connection and line length limits
//! - Configuration via CLI arguments or TOML file

mod broadcast;
mod config;
mod protocol;
mod registry;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        idle_timeout = config.idle_timeout,
        write_timeout = config.write_timeout,
        max_line_length = config.max_line_length,
        "Starting line-chat server"
    );

    if let Err(e) = Server::new(config).run().await {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }
    Ok(())
}
