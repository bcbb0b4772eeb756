//! WebSocket Frame Types
//!
//! JSON text frames exchanged between the gateway and its clients.
//! Server frames carry an `event` tag, except live device updates which
//! are plain `{asset_uuid, data, timestamp}` objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Seconds since the Unix epoch with sub-second precision
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Frames sent from the gateway to a client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Directory mode: every known device with its cached state
    DevicesList {
        timestamp: f64,
        devices: Vec<DeviceListing>,
    },
    /// Per-device snapshot sent once after registration
    ConnectionEstablished {
        device_uuid: String,
        timestamp: f64,
        data_items: Map<String, Value>,
        connection_count: usize,
    },
    /// Keepalive
    Ping {
        timestamp: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_devices: Option<usize>,
    },
    /// Error report; the connection stays open unless stated otherwise
    Error { message: String, timestamp: f64 },
    /// Reply to `simulation_mode`
    SimulationModeUpdated {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: f64,
    },
    /// Reply to `drop_stream`
    StreamDropped {
        success: bool,
        device_uuid: String,
        timestamp: f64,
    },
}

impl ServerFrame {
    pub fn ping() -> Self {
        ServerFrame::Ping {
            timestamp: unix_timestamp(),
            active_devices: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            timestamp: unix_timestamp(),
        }
    }

    /// Serialize to the JSON text sent on the socket
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize server frame");
            r#"{"event":"error","message":"internal serialization error"}"#.to_string()
        })
    }
}

/// One device in a `devices_list` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceListing {
    pub device_uuid: String,
    #[serde(default)]
    pub dataitems: Map<String, Value>,
    #[serde(default)]
    pub durations: Map<String, Value>,
}

/// Live update broadcast to a device's connections
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateFrame {
    pub asset_uuid: String,
    pub data: Map<String, Value>,
    pub timestamp: f64,
}

impl UpdateFrame {
    /// Build an update stamped with the current time
    pub fn new(asset_uuid: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            asset_uuid: asset_uuid.into(),
            data,
            timestamp: unix_timestamp(),
        }
    }
}

/// Commands a client may send on a per-device connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Forward a named command with arguments to the device command channel
    SimulationMode { name: String, args: Value },
    /// Drop the device's derived stream and forget its session
    DropStream,
    /// Anything else; answered with an error frame
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Map<String, Value>,
}

/// Client frames that cannot be turned into a [`ClientCommand`]
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Message parsing error: {0}")]
    Malformed(serde_json::Error),

    #[error("Missing name or args for simulation mode")]
    MissingSimulationParams,
}

impl ClientCommand {
    /// Decode a client text frame of the form `{method, params}`
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let raw: RawCommand = serde_json::from_value(value).map_err(ProtocolError::Malformed)?;

        match raw.method.as_str() {
            "simulation_mode" => {
                let name = raw
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty());
                let args = raw.params.get("args").filter(|args| !args.is_null());

                match (name, args) {
                    (Some(name), Some(args)) => Ok(ClientCommand::SimulationMode {
                        name: name.to_string(),
                        args: args.clone(),
                    }),
                    _ => Err(ProtocolError::MissingSimulationParams),
                }
            }
            "drop_stream" => Ok(ClientCommand::DropStream),
            _ => Ok(ClientCommand::Unknown(raw.method)),
        }
    }
}

/// Render command arguments as the lower-case text the command stream expects
pub fn command_value(args: &Value) -> String {
    match args {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}
