//! peercache Sidecar Entry Point
//!
//! Loads configuration from the environment, sets up logging and runs the
//! sidecar until SIGINT or SIGTERM.

use peercache_core::PeerCacheResult;
use peercache_sidecar::{init_tracing, supervisor, SidecarConfig};

#[tokio::main]
async fn main() -> PeerCacheResult<()> {
    let config = SidecarConfig::from_env()?;
    init_tracing(config.debug)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cache_dir = ?config.cache_dir,
        discovery = config.discovery.method(),
        port = config.port,
        serve_inventory = config.serve_inventory,
        "Starting peercache sidecar"
    );

    supervisor::run(config).await
}
