//! External Collaborators
//!
//! The gateway provisions derived streams, reads the device directory and
//! forwards device commands through these traits. The ksqlDB-backed
//! implementations talk to the ksqlDB REST API.
//!
//! - [`StreamProvisioner`]: create / drop a device's derived stream
//! - [`DeviceDirectory`]: device listing, cached data items, sidecar lookups
//! - [`CommandChannel`]: device command stream

mod command;
mod device;
mod ksql;
mod provision;

pub use command::KsqlCommandChannel;
pub use device::{EnrichmentKind, KsqlDeviceDirectory};
pub use ksql::{quote_literal, sanitize_identifier, KsqlClient};
pub use provision::KsqlStreamProvisioner;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Creates and drops per-device derived streams
#[async_trait]
pub trait StreamProvisioner: Send + Sync {
    /// Provision the derived stream for `device_id` and return its topic name.
    async fn provision(&self, device_id: &str) -> Result<String, ServiceError>;

    /// Drop the derived stream for `device_id`.
    async fn deprovision(&self, device_id: &str) -> Result<(), ServiceError>;
}

/// Read access to the device directory and its sidecar tables
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Ids of every known device
    async fn list_devices(&self) -> Result<Vec<String>, ServiceError>;

    /// Current cached data items of a device (`ID -> VALUE`)
    async fn data_items(&self, device_id: &str) -> Result<Map<String, Value>, ServiceError>;

    /// Accumulated state durations for a device
    async fn duration_stats(&self, device_id: &str) -> Result<Map<String, Value>, ServiceError>;

    /// Add sidecar data to an update for `device_id`. A no-op for devices
    /// without an enrichment rule.
    async fn enrich(&self, device_id: &str, data: &mut Map<String, Value>) -> Result<(), ServiceError>;
}

/// Sends commands back into the device stream
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send command `name` with textual `value`.
    async fn send(&self, name: &str, value: &str) -> Result<(), ServiceError>;
}

/// Errors raised by collaborator calls
#[derive(Debug, Error)]
pub enum ServiceError {
    /// ksqlDB could not be reached
    #[error("ksqlDB unavailable")]
    Unavailable,

    /// ksqlDB did not answer in time
    #[error("ksqlDB request timeout")]
    Timeout,

    /// Other HTTP transport failure
    #[error("ksqlDB request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ksqlDB answered with an error status
    #[error("ksqlDB returned {status}: {message}")]
    Ksql { status: u16, message: String },

    /// ksqlDB answered with something we could not interpret
    #[error("Unexpected ksqlDB response: {0}")]
    InvalidResponse(String),

    /// A record lacked a field needed for a lookup
    #[error("Missing field {0} in update")]
    MissingField(&'static str),

    /// Creating the derived stream failed
    #[error("Failed to create stream for device {device_id}: {reason}")]
    Provision { device_id: String, reason: String },

    /// Dropping the derived stream failed
    #[error("Failed to drop stream for device {device_id}: {reason}")]
    Deprovision { device_id: String, reason: String },

    /// Sending a device command failed
    #[error("Failed to send command {name}: {reason}")]
    Command { name: String, reason: String },
}
