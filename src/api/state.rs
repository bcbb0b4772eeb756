//! Application State
//!
//! Shared state accessible by all handlers.
//! Cloned into every request; the heavy parts live behind `Arc`.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::services::{CommandChannel, DeviceDirectory, StreamProvisioner};
use crate::stream::{
    BridgePump, ConsumerFactory, HandoffQueue, PumpConfig, SubscriptionConfig, TopicSubscriber,
};
use crate::websocket::{ConnectionRegistry, DeviceSessions, RegistryConfig};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Live WebSocket connections per device
    pub registry: ConnectionRegistry,
    /// Per-device provisioning state
    pub devices: Arc<DeviceSessions>,
    /// Topic workers feeding the handoff queue
    pub subscriber: Arc<TopicSubscriber>,
    /// Records waiting for the bridge pump
    pub handoff: Arc<HandoffQueue>,
    /// Device listing, cached items and enrichment lookups
    pub directory: Arc<dyn DeviceDirectory>,
    /// Device command stream
    pub commands: Arc<dyn CommandChannel>,
    pub config: Arc<Config>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Wire the gateway together from its configuration and collaborators
    pub fn new(
        config: Config,
        factory: Arc<dyn ConsumerFactory>,
        provisioner: Arc<dyn StreamProvisioner>,
        directory: Arc<dyn DeviceDirectory>,
        commands: Arc<dyn CommandChannel>,
    ) -> Self {
        let registry = ConnectionRegistry::new(RegistryConfig {
            mailbox_capacity: config.gateway.mailbox_capacity,
            max_connections: config.gateway.max_connections,
        });

        let subscriber = Arc::new(TopicSubscriber::new(
            factory,
            SubscriptionConfig {
                poll_timeout: std::time::Duration::from_millis(config.stream.poll_timeout_ms),
                join_timeout: std::time::Duration::from_millis(config.stream.join_timeout_ms),
            },
        ));
        let handoff = Arc::new(HandoffQueue::new(config.stream.handoff_capacity));

        let devices = Arc::new(DeviceSessions::new(
            provisioner,
            Arc::clone(&subscriber),
            Arc::clone(&handoff),
            config.stream.group_prefix.clone(),
        ));

        Self {
            registry,
            devices,
            subscriber,
            handoff,
            directory,
            commands,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Spawn the bridge pump and the connection stats reporter. Both stop
    /// when `cancel` fires.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let pump = BridgePump::new(
            Arc::clone(&self.handoff),
            self.registry.clone(),
            Arc::clone(&self.directory),
            PumpConfig {
                interval: std::time::Duration::from_millis(self.config.stream.pump_interval_ms),
            },
        );

        vec![
            tokio::spawn(pump.run(cancel.clone())),
            tokio::spawn(report_stats(self.clone(), cancel)),
        ]
    }

    /// Stop every topic worker. Joining happens on a blocking thread.
    pub async fn shutdown(&self) {
        let subscriber = Arc::clone(&self.subscriber);
        match tokio::task::spawn_blocking(move || subscriber.unsubscribe_all()).await {
            Ok(stopped) => tracing::info!(topics = stopped, "Stopped topic workers"),
            Err(e) => tracing::error!(error = %e, "Failed to stop topic workers"),
        }
    }
}

async fn report_stats(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.gateway.stats_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let connections = state.registry.total_count().await;
                let devices = state.registry.device_count().await;
                tracing::info!(
                    connections,
                    devices,
                    topics = state.subscriber.active_topics().len(),
                    handoff_queued = state.handoff.len(),
                    handoff_dropped = state.handoff.dropped(),
                    "Gateway stats"
                );
            }
        }
    }
}
