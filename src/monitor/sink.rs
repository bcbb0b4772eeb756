//! Fan-in sink shared by every device loop, plus the local consumers
//! that read from it.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::directory::DirectoryEntry;

/// A JSON frame received on a device connection
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFrame {
    pub device_id: String,
    pub payload: Value,
}

/// Sending half of the fan-in channel. Never blocks a device loop.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<DeviceFrame>,
}

/// Create a bounded fan-in channel
pub fn frame_channel(capacity: usize) -> (FrameSink, mpsc::Receiver<DeviceFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSink { tx }, rx)
}

impl FrameSink {
    /// Hand a frame to the consumers. Returns `false` if it was dropped.
    pub fn deliver(&self, frame: DeviceFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(device_id = %frame.device_id, "Frame sink full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                tracing::debug!(device_id = %frame.device_id, "Frame sink closed, dropping frame");
                false
            }
        }
    }
}

/// A single data item update extracted from a live update frame
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub asset_uuid: String,
    pub item_id: String,
    pub value: Value,
    pub timestamp: Option<String>,
}

impl DeviceUpdate {
    /// Extract the update carried by a frame. Event frames (pings,
    /// snapshots, replies) and updates without a data item id yield `None`.
    pub fn from_frame(frame: &DeviceFrame) -> Option<Self> {
        let payload = frame.payload.as_object()?;
        if payload.contains_key("event") {
            return None;
        }

        let data = payload.get("data")?.as_object()?;
        let item_id = data.get("ID")?.as_str()?.to_string();
        let asset_uuid = payload
            .get("asset_uuid")
            .and_then(Value::as_str)
            .unwrap_or(&frame.device_id)
            .to_string();

        Some(Self {
            asset_uuid,
            item_id,
            value: data.get("VALUE").cloned().unwrap_or(Value::Null),
            timestamp: data.get("TIMESTAMP").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Display category of a data item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Tool,
    Gate,
    Sensor,
    Condition,
}

impl ItemKind {
    /// Classify a data item by its id
    pub fn classify(item_id: &str) -> Self {
        if item_id.contains("Tool") {
            ItemKind::Tool
        } else if item_id.contains("Gate") {
            ItemKind::Gate
        } else if item_id.contains("concentration") {
            ItemKind::Sensor
        } else {
            ItemKind::Condition
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Tool => "tool",
            ItemKind::Gate => "gate",
            ItemKind::Sensor => "sensor",
            ItemKind::Condition => "condition",
        }
    }
}

/// Cached value of one data item
#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    pub kind: ItemKind,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
struct CachedDevice {
    items: HashMap<String, CachedItem>,
    durations: Map<String, Value>,
}

/// Latest known data items per device
#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: HashMap<String, CachedDevice>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache from a directory listing
    pub fn seed(&mut self, entries: &[DirectoryEntry]) {
        for entry in entries {
            let device = self.devices.entry(entry.device_uuid.clone()).or_default();
            replace_items(device, &entry.dataitems);
            device.durations = entry.durations.clone();
        }
    }

    /// Apply a frame; returns the update it carried, if any
    pub fn apply(&mut self, frame: &DeviceFrame) -> Option<DeviceUpdate> {
        if frame.payload.get("event").and_then(Value::as_str) == Some("connection_established") {
            if let Some(items) = frame.payload.get("data_items").and_then(Value::as_object) {
                let device = self.devices.entry(frame.device_id.clone()).or_default();
                replace_items(device, items);
            }
            return None;
        }

        let update = DeviceUpdate::from_frame(frame)?;
        let device = self.devices.entry(update.asset_uuid.clone()).or_default();
        device.items.insert(
            update.item_id.clone(),
            CachedItem {
                kind: ItemKind::classify(&update.item_id),
                value: update.value.clone(),
            },
        );
        if let Some(Value::Object(durations)) = frame.payload.pointer("/data/durations") {
            device.durations = durations.clone();
        }
        Some(update)
    }

    pub fn item(&self, device_id: &str, item_id: &str) -> Option<&CachedItem> {
        self.devices.get(device_id)?.items.get(item_id)
    }

    pub fn durations(&self, device_id: &str) -> Option<&Map<String, Value>> {
        self.devices.get(device_id).map(|d| &d.durations)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn replace_items(device: &mut CachedDevice, items: &Map<String, Value>) {
    device.items = items
        .iter()
        .map(|(id, value)| {
            (
                id.clone(),
                CachedItem {
                    kind: ItemKind::classify(id),
                    value: value.clone(),
                },
            )
        })
        .collect();
}
