//! devgate monitor client
//!
//! Subscribes to one gateway socket per device, reconnecting with backoff,
//! and logs every update it receives.
//!
//! Run with: cargo run --bin devgate-monitor -- --device IVAC --device DUSTTRAK

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use devgate::config::{Config, RetryPolicy};
use devgate::monitor::{
    fetch_directory, frame_channel, DeviceCache, DeviceFrame, ReconnectingSubscriber,
    SubscriberConfig,
};

#[derive(Parser)]
#[command(name = "devgate-monitor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Follow live device updates from a devgate gateway")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway WebSocket base URL (e.g. ws://localhost:8000/ws)
    #[arg(long)]
    url: Option<String>,

    /// Device to follow; repeat for several. Defaults to every listed device.
    #[arg(short, long = "device")]
    devices: Vec<String>,

    /// Reconnect policy (bounded, unbounded)
    #[arg(long)]
    policy: Option<RetryPolicy>,

    /// Consecutive failures before a device is abandoned (bounded policy)
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(url) = cli.url {
        config.monitor.url = url;
    }
    if let Some(policy) = cli.policy {
        config.monitor.policy = policy;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.monitor.max_attempts = max_attempts;
    }

    devgate::logging::init(&config.logging);

    let mut cache = DeviceCache::new();
    let devices = if cli.devices.is_empty() {
        let limit = Duration::from_millis(config.monitor.connect_timeout_ms);
        let entries = fetch_directory(&config.monitor.url, limit)
            .await
            .context("fetching device directory")?;
        cache.seed(&entries);
        entries.into_iter().map(|e| e.device_uuid).collect()
    } else {
        cli.devices
    };

    if devices.is_empty() {
        tracing::warn!("No devices to monitor");
        return Ok(());
    }

    let (sink, frames) = frame_channel(config.monitor.sink_capacity);
    let subscriber = ReconnectingSubscriber::new(SubscriberConfig::from_config(&config.monitor), sink);
    let started = subscriber.start(devices);
    tracing::info!(
        devices = started,
        url = %config.monitor.url,
        policy = ?config.monitor.policy,
        "Monitoring devices"
    );

    let consumer = tokio::spawn(consume(frames, cache));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Shutting down...");

    for (device_id, outcome) in subscriber.shutdown().await {
        tracing::info!(device_id = %device_id, outcome = ?outcome, "Device loop finished");
    }
    drop(subscriber);

    let cache = consumer.await.context("joining consumer")?;
    tracing::info!(devices = cache.device_ids().len(), "Monitor shutdown complete");
    Ok(())
}

/// Logs each update and keeps the cache current until every sender is gone
async fn consume(mut frames: mpsc::Receiver<DeviceFrame>, mut cache: DeviceCache) -> DeviceCache {
    while let Some(frame) = frames.recv().await {
        if frame.payload["event"] == "error" {
            tracing::warn!(
                device_id = %frame.device_id,
                message = %frame.payload["message"],
                "Gateway reported an error"
            );
            continue;
        }

        if let Some(update) = cache.apply(&frame) {
            let kind = cache
                .item(&update.asset_uuid, &update.item_id)
                .map(|item| item.kind.as_str())
                .unwrap_or("condition");
            tracing::info!(
                device_id = %update.asset_uuid,
                item = %update.item_id,
                kind,
                value = %update.value,
                timestamp = update.timestamp.as_deref().unwrap_or(""),
                "Update"
            );
        }
    }
    cache
}
