//! comet: connection gateway binary
//!
//! Configuration via CLI arguments or TOML file.

use std::sync::Arc;

use comet::{Config, DefaultOperator, Server};
use tracing::info;
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
        handshake_timeout = ?config.handshake_timeout,
        heartbeat = ?config.heartbeat,
        buckets = config.buckets,
        timers = config.timers,
        "Starting comet gateway"
    );

    let operator = Arc::new(DefaultOperator::new(config.heartbeat));
    Server::new(config, operator).run().await?;
    Ok(())
}
