//! devgate gateway server
//!
//! Run with: cargo run --features kafka --bin devgate
//!
//! # Configuration
//!
//! Read from `--config`, or the first of `$XDG_CONFIG/devgate/config.toml`,
//! `/etc/devgate/config.toml` and `./config.toml`. Environment overrides:
//! - `DEVGATE_HOST`, `DEVGATE_PORT`: bind address (default: 0.0.0.0:8000)
//! - `DEVGATE_KAFKA_BROKERS`: bootstrap servers (default: broker:29092)
//! - `DEVGATE_KSQLDB_URL`: ksqlDB server (default: http://ksqldb-server:8088)
//! - `DEVGATE_LOG_LEVEL`, `DEVGATE_LOG_FORMAT`: logging
//! - `RUST_LOG`: overrides the log filter entirely

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use devgate::api::{serve, AppState};
use devgate::config::{generate_default_config, Config};
use devgate::services::{KsqlClient, KsqlCommandChannel, KsqlDeviceDirectory, KsqlStreamProvisioner};
use devgate::stream::KafkaConsumerFactory;

#[derive(Parser)]
#[command(name = "devgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time device stream gateway")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_default(),
    };

    devgate::logging::init(&config.logging);
    tracing::info!("Starting devgate v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        brokers = %config.stream.brokers,
        ksqldb = %config.ksqldb.url,
        "Stream platform"
    );

    let ksql = Arc::new(
        KsqlClient::new(config.ksqldb.url.clone(), config.ksqldb.request_timeout())
            .context("building ksqlDB client")?,
    );
    let provisioner = Arc::new(KsqlStreamProvisioner::new(
        Arc::clone(&ksql),
        config.ksqldb.source_stream.clone(),
        config.ksqldb.timestamp_zone.clone(),
    ));
    let directory = Arc::new(KsqlDeviceDirectory::new(
        Arc::clone(&ksql),
        config.ksqldb.stats.clone(),
        config.ksqldb.enrichment.clone(),
    ));
    let commands = Arc::new(KsqlCommandChannel::new(
        Arc::clone(&ksql),
        config.ksqldb.command_stream.clone(),
        config.ksqldb.command_asset.clone(),
    ));
    let factory = Arc::new(KafkaConsumerFactory::new(config.stream.brokers.clone()));

    let state = AppState::new(config, factory, provisioner, directory, commands);

    let cancel = CancellationToken::new();
    let background = state.spawn_background(cancel.clone());

    let served = serve(state.clone()).await;

    tracing::info!("Shutting down...");
    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task failed");
        }
    }
    state.shutdown().await;

    served?;
    tracing::info!("devgate shutdown complete");
    Ok(())
}
