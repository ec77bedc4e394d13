//! # strand
//!
//! Realtime bidirectional RPC and pub/sub hub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! strand-server
//!
//! # Run with a custom config
//! STRAND_CONFIG=/etc/strand/strand.toml strand-server
//!
//! # Override the listen address
//! STRAND_ADDRESS=0.0.0.0:8220 strand-server
//! ```

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strand_core::HubSource;
use strand_server::bus;
use strand_server::config::{Config, HubMode};
use strand_server::{metrics, run_server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strand=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        address = %config.address,
        base_path = %config.base_path,
        "starting strand hub server"
    );

    metrics::init_metrics();

    let source = match config.hub_mode {
        HubMode::Singleton => HubSource::singleton(bus::message_bus_hub()),
        HubMode::PerConnection => HubSource::per_connection(bus::message_bus_hub),
    };

    run_server(config, source).await
}
