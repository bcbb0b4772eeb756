//! Monitor client
//!
//! Client side of the gateway: fetches the device directory, keeps one
//! reconnecting socket per device and fans every received frame into a
//! single local sink.
//!
//! # Architecture
//!
//! ```text
//! gateway /ws/devices/{id} ──► device loop (backoff) ──┐
//! gateway /ws/devices/{id} ──► device loop (backoff) ──┼──► FrameSink ──► DeviceCache
//! gateway /ws/devices/{id} ──► device loop (backoff) ──┘
//! ```

mod backoff;
mod directory;
mod sink;
mod subscriber;

pub use backoff::{backoff_delay, BackoffPolicy, Termination};
pub use directory::{device_url, directory_url, fetch_directory, DirectoryEntry};
pub use sink::{frame_channel, CachedItem, DeviceCache, DeviceFrame, DeviceUpdate, FrameSink, ItemKind};
pub use subscriber::{MonitorOutcome, ReconnectingSubscriber, SubscriberConfig};

use std::time::Duration;
use thiserror::Error;

/// Monitor client errors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}
