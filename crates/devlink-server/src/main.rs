//! # devlink
//!
//! Main/sub device relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! devlink
//!
//! # Run with a specific config file
//! DEVLINK_CONFIG=/path/to/devlink.toml devlink
//!
//! # Override single values from the environment
//! DEVLINK__PORT=8080 DEVLINK__HOST=0.0.0.0 devlink
//! ```

use anyhow::Result;
use devlink_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devlink=debug,devlink_server=debug,devlink_core=debug,devlink_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting devlink server on {}:{}", config.host, config.port);

    // Install the exporter, then describe metrics
    metrics::init_metrics(&config.metrics);

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
