//! One-shot device directory fetch over the gateway's directory socket.

use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use super::MonitorError;
use crate::websocket::DeviceListing;

/// A device as listed by the gateway directory
pub type DirectoryEntry = DeviceListing;

/// Directory socket URL for a gateway base URL
pub fn directory_url(base: &str) -> String {
    format!("{}/devices", base.trim_end_matches('/'))
}

/// Device socket URL for a gateway base URL
pub fn device_url(base: &str, device_id: &str) -> String {
    format!("{}/devices/{}", base.trim_end_matches('/'), device_id)
}

/// Connect to the directory socket and return the first `devices_list`.
///
/// Pings and other event frames before the listing are skipped. An `error`
/// frame aborts the fetch.
pub async fn fetch_directory(
    base: &str,
    limit: Duration,
) -> Result<Vec<DirectoryEntry>, MonitorError> {
    let url = directory_url(base);
    tracing::debug!(url = %url, "Fetching device directory");

    timeout(limit, read_listing(&url))
        .await
        .map_err(|_| MonitorError::Timeout(limit))?
}

async fn read_listing(url: &str) -> Result<Vec<DirectoryEntry>, MonitorError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: Value = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed directory frame");
                continue;
            }
        };

        match frame.get("event").and_then(Value::as_str) {
            Some("devices_list") => {
                let devices = frame.get("devices").cloned().unwrap_or(Value::Null);
                let entries: Vec<DirectoryEntry> = serde_json::from_value(devices)
                    .map_err(|e| MonitorError::Protocol(e.to_string()))?;
                let _ = ws.close(None).await;
                return Ok(entries);
            }
            Some("error") => {
                let message = frame
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("directory error");
                return Err(MonitorError::Protocol(message.to_string()));
            }
            _ => continue,
        }
    }

    Err(MonitorError::Closed)
}
