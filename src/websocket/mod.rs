//! WebSocket Gateway
//!
//! Streams live device updates to WebSocket clients.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: live connections per device, one mailbox each
//! - **DeviceSessions**: lazy per-device provisioning shared across connections
//! - **Handler**: per-device session (snapshot, keepalive, commands)
//! - **Directory**: device listing plus heartbeats
//! - **Frames**: server frame and client command formats
//!
//! ## Usage
//!
//! - `<base>/devices` - directory mode
//! - `<base>/devices/{device_id}` - live updates for one device
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8000/ws/devices/IVAC');
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.asset_uuid) console.log('Update:', msg.data);
//! };
//!
//! ws.send(JSON.stringify({method: 'simulation_mode', params: {name: 'SimulationMode', args: true}}));
//! ```

mod devices;
mod directory;
mod frames;
mod handler;
mod registry;

pub use devices::{DeviceSession, DeviceSessions};
pub use directory::{build_listing, directory_handler};
pub use frames::{
    command_value, unix_timestamp, ClientCommand, DeviceListing, ProtocolError, ServerFrame,
    UpdateFrame,
};
pub use handler::{device_handler, SessionState};
pub use registry::{
    BroadcastReport, ConnectionId, ConnectionRegistry, Mailbox, RegistryConfig, RegistryError,
};

use thiserror::Error;

use crate::services::ServiceError;
use crate::stream::StreamError;

/// Errors that end a gateway session before it becomes active
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to provision stream for device {device_id}: {source}")]
    Provisioning {
        device_id: String,
        source: ServiceError,
    },

    #[error("Failed to subscribe device stream: {0}")]
    Subscribe(StreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}
