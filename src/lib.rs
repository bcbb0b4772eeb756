//! # devgate
//!
//! Real-time device stream gateway: bridges per-device Kafka topics to many
//! concurrently connected WebSocket clients.
//!
//! ## Features
//!
//! - **On-demand provisioning**: derived per-device streams are created
//!   through ksqlDB the first time a device is watched
//! - **Blocking consumers, async fan-out**: one consumer thread per topic,
//!   bridged into the runtime through a drop-oldest handoff queue
//! - **Per-connection mailboxes**: broadcasts never hold the registry lock
//!   while delivering
//! - **Reconnecting client**: per-device backoff loops with bounded or
//!   unbounded retry
//!
//! ## Modules
//!
//! - [`stream`]: topic subscriptions, record decoding, handoff queue and pump
//! - [`websocket`]: connection registry, device sessions and socket handlers
//! - [`services`]: ksqlDB-backed provisioning, directory and command channel
//! - [`api`]: HTTP server with Axum
//! - [`monitor`]: reconnecting subscriber client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devgate::monitor::{frame_channel, ReconnectingSubscriber, SubscriberConfig};
//! use devgate::config::MonitorConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (sink, mut frames) = frame_channel(1024);
//!     let subscriber = ReconnectingSubscriber::new(
//!         SubscriberConfig::from_config(&MonitorConfig::default()),
//!         sink,
//!     );
//!     subscriber.start(["IVAC"]);
//!
//!     while let Some(frame) = frames.recv().await {
//!         println!("{}: {}", frame.device_id, frame.payload);
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod services;
pub mod stream;
pub mod websocket;

// Re-export top-level types for convenience
pub use api::{build_router, serve, ApiError, AppState};

pub use config::{
    Config, ConfigError, GatewayConfig, KsqlDbConfig, LoggingConfig, MonitorConfig, RetryPolicy,
    StreamConfig,
};

pub use stream::{
    BridgePump, ConsumerFactory, HandoffQueue, MemoryBroker, RecordConsumer, StreamError,
    StreamRecord, TopicSubscriber,
};

pub use services::{CommandChannel, DeviceDirectory, ServiceError, StreamProvisioner};

pub use websocket::{
    ClientCommand, ConnectionRegistry, DeviceSessions, GatewayError, RegistryError, ServerFrame,
    UpdateFrame,
};

pub use monitor::{
    BackoffPolicy, DeviceCache, MonitorError, MonitorOutcome, ReconnectingSubscriber,
};
