//! line-listener: a single-connection TCP line printer
//!
//! Listens on port 8000 on all interfaces, accepts exactly one client and
//! prints every newline-terminated line it sends, prefixed with
//! `Message Received:`.
//!
//! Features:
//! - Raw byte line framing on `\n`
//! - Configurable behavior once the client goes away (idle, spin, exit)
//! - Configuration via CLI arguments or TOML file
//!
//! Stdout carries only the startup line and received messages; diagnostics
//! go to stderr.

mod config;
mod framing;
mod server;

use config::Config;
use server::{Listener, LISTEN_ADDR};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %LISTEN_ADDR,
        on_disconnect = ?config.on_disconnect,
        "Starting line-listener"
    );

    let mut stdout = tokio::io::stdout();
    server::announce(&mut stdout).await?;

    let listener = Listener::bind(LISTEN_ADDR)?;
    info!(address = ?listener.local_addr().ok(), "Waiting for a connection");
    let conn = listener.accept().await?;
    info!(peer = ?conn.peer_addr(), "Serving connection");

    match conn.serve(&mut stdout, config.on_disconnect).await {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "Listener stopped");
            Err(e.into())
        }
    }
}
