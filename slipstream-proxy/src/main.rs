//! Slipstream Proxy Engine
//!
//! The main Tokio async engine that fronts a pool of inference backends
//! with admission control, health reconciliation, and failover.

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slipstream_admin::JsonFileStore;
use slipstream_proxy::{health_check, server, AppState, Config};

/// The primary entrypoint for the Slipstream proxy engine.
///
/// Parses configuration, hydrates the registry from the durable store,
/// starts the health monitor, and serves until the process is stopped.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(JsonFileStore::new(&config.store_path));
    let state = AppState::new(config, store);

    let loaded = state.load_registry().await?;
    info!(nodes = loaded, "registry hydrated from store");

    health_check::monitor::spawn_health_monitor(Arc::clone(&state));

    server::run(state).await?;
    Ok(())
}
