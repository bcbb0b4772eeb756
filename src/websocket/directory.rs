//! Directory mode: one device listing, then heartbeats until the client leaves.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

use super::frames::{unix_timestamp, DeviceListing, ServerFrame};
use super::handler::{send_close, send_text};
use crate::api::AppState;
use crate::services::{DeviceDirectory, ServiceError};

/// WebSocket upgrade handler for `<base>/devices`
pub async fn directory_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_directory_socket(socket, state))
}

/// Every known device with its cached data items and durations.
/// Devices whose details cannot be loaded are left out.
pub async fn build_listing(directory: &dyn DeviceDirectory) -> Result<Vec<DeviceListing>, ServiceError> {
    let ids = directory.list_devices().await?;
    let mut listing = Vec::with_capacity(ids.len());

    for device_uuid in ids {
        let dataitems = match directory.data_items(&device_uuid).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(device_id = %device_uuid, error = %e, "Skipping device in listing");
                continue;
            }
        };
        let durations = match directory.duration_stats(&device_uuid).await {
            Ok(durations) => durations,
            Err(e) => {
                tracing::warn!(device_id = %device_uuid, error = %e, "Skipping device in listing");
                continue;
            }
        };

        listing.push(DeviceListing {
            device_uuid,
            dataitems,
            durations,
        });
    }

    Ok(listing)
}

/// Heartbeat for a directory client; counts the devices it was sent
fn heartbeat(listed: usize) -> ServerFrame {
    ServerFrame::Ping {
        timestamp: unix_timestamp(),
        active_devices: Some(listed),
    }
}

async fn handle_directory_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let write_timeout = state.config.gateway.write_timeout();
    let (first, listed) = match build_listing(state.directory.as_ref()).await {
        Ok(devices) => {
            let listed = devices.len();
            let frame = ServerFrame::DevicesList {
                timestamp: unix_timestamp(),
                devices,
            };
            (frame, Some(listed))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to list devices");
            (ServerFrame::error(format!("Failed to list devices: {}", e)), None)
        }
    };

    let sent = send_text(&mut socket, first.to_text(), write_timeout).await;
    let listed = match (sent, listed) {
        (Ok(()), Some(listed)) => listed,
        _ => {
            send_close(&mut socket, write_timeout).await;
            return;
        }
    };

    let mut ticker = tokio::time::interval(state.config.gateway.directory_heartbeat());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(failure) = send_text(&mut socket, heartbeat(listed).to_text(), write_timeout).await {
                    tracing::debug!(?failure, "Directory heartbeat not delivered");
                    break;
                }
            }
            incoming = socket.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("Directory client disconnected");
    send_close(&mut socket, write_timeout).await;
}
