//! kubed
//!
//! Cluster daemon that keeps annotated Secrets and ConfigMaps synchronized
//! across namespaces, and optionally mirrors object state into a search index
//! and keeps deleted objects in a recycle bin.

mod config;
mod controller;
mod error;
mod writer;

use crate::config::ClusterConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls stack needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting kubed");

    let config = ClusterConfig::load()?;

    info!("Configuration:");
    info!("  Config syncer: {}", config.enable_config_syncer);
    info!("  Search index: {}", config.api_server.enable_search_index);
    match &config.recycle_bin {
        Some(bin) => info!(
            "  Recycle bin: {} (updates: {})",
            bin.path.display(),
            bin.handle_updates
        ),
        None => info!("  Recycle bin: disabled"),
    }
    info!("  Resync period: {:?}", config.resync_period());
    info!("  Write timeout: {:?}", config.write_timeout());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
