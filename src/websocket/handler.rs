//! WebSocket Handler
//!
//! Per-device gateway sessions: registration, lazy device initialization,
//! snapshot, then a paired sender/receiver until either side finishes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use serde_json::Map;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::frames::{command_value, unix_timestamp, ClientCommand, ServerFrame};
use super::registry::{ConnectionId, ConnectionRegistry, Mailbox};
use crate::api::AppState;

/// Lifecycle of a per-device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Registered => "registered",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// WebSocket upgrade handler for `<base>/devices/{device_id}`
pub async fn device_handler(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, device_id, state))
}

/// Why a frame could not be written to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SendFailure {
    Closed,
    /// The client stopped accepting data
    TimedOut,
}

/// Send one text frame, giving up after `limit`
pub(super) async fn send_text<S>(sink: &mut S, text: String, limit: Duration) -> Result<(), SendFailure>
where
    S: Sink<Message> + Unpin,
{
    match tokio::time::timeout(limit, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(SendFailure::Closed),
        Err(_) => Err(SendFailure::TimedOut),
    }
}

/// Best-effort close frame, bounded by `limit`
pub(super) async fn send_close<S>(sink: &mut S, limit: Duration)
where
    S: Sink<Message> + Unpin,
{
    let _ = tokio::time::timeout(limit, sink.send(Message::Close(None))).await;
}

/// Unregisters its connection when released or dropped.
struct UnregisterGuard {
    registry: ConnectionRegistry,
    connection_id: Option<ConnectionId>,
}

impl UnregisterGuard {
    fn new(registry: ConnectionRegistry, connection_id: ConnectionId) -> Self {
        Self {
            registry,
            connection_id: Some(connection_id),
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.connection_id.take() {
            self.registry.unregister(&id).await;
        }
    }
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        let Some(id) = self.connection_id.take() else {
            return;
        };
        let registry = self.registry.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.unregister(&id).await;
            });
        }
    }
}

struct Session {
    connection_id: ConnectionId,
    device_id: String,
    state: SessionState,
}

impl Session {
    fn advance(&mut self, next: SessionState) {
        tracing::debug!(
            connection_id = %self.connection_id,
            device_id = %self.device_id,
            from = %self.state,
            to = %next,
            "Session state change"
        );
        self.state = next;
    }
}

/// Handle an established per-device WebSocket connection
async fn handle_device_socket(mut socket: WebSocket, device_id: String, state: Arc<AppState>) {
    let write_timeout = state.config.gateway.write_timeout();
    let (connection_id, mailbox) = match state.registry.register(&device_id).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "Failed to register WebSocket connection");
            let _ = send_text(&mut socket, ServerFrame::error(e.to_string()).to_text(), write_timeout).await;
            send_close(&mut socket, write_timeout).await;
            return;
        }
    };
    let guard = UnregisterGuard::new(state.registry.clone(), connection_id.clone());

    let mut session = Session {
        connection_id: connection_id.clone(),
        device_id: device_id.clone(),
        state: SessionState::Connecting,
    };
    session.advance(SessionState::Registered);

    if let Err(e) = state.devices.ensure_initialized(&device_id).await {
        tracing::error!(device_id = %device_id, error = %e, "Device initialization failed");
        let _ = send_text(&mut socket, ServerFrame::error(e.to_string()).to_text(), write_timeout).await;
        send_close(&mut socket, write_timeout).await;
        session.advance(SessionState::Closing);
        guard.release().await;
        session.advance(SessionState::Closed);
        return;
    }

    if let Err(failure) = send_snapshot(&mut socket, &state, &device_id).await {
        tracing::debug!(connection_id = %connection_id, ?failure, "Client did not take the snapshot");
        session.advance(SessionState::Closing);
        guard.release().await;
        session.advance(SessionState::Closed);
        return;
    }

    session.advance(SessionState::Active);
    let (sink, stream) = socket.split();

    let mut send_task = tokio::spawn(send_loop(
        sink,
        mailbox,
        state.config.gateway.heartbeat_interval(),
        write_timeout,
        connection_id.clone(),
    ));

    let dispatcher = CommandDispatcher {
        state: Arc::clone(&state),
        connection_id: connection_id.clone(),
        device_id: device_id.clone(),
    };
    let mut recv_task = tokio::spawn(recv_loop(
        stream,
        dispatcher,
        state.config.gateway.receive_timeout(),
    ));

    // Whichever side finishes first wins; the other is cancelled and awaited.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    session.advance(SessionState::Closing);
    guard.release().await;
    session.advance(SessionState::Closed);
}

async fn send_snapshot(
    socket: &mut WebSocket,
    state: &AppState,
    device_id: &str,
) -> Result<(), SendFailure> {
    let write_timeout = state.config.gateway.write_timeout();
    let data_items = match state.directory.data_items(device_id).await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "Failed to load cached data items");
            let message = format!("Failed to load device data: {}", e);
            send_text(socket, ServerFrame::error(message).to_text(), write_timeout).await?;
            Map::new()
        }
    };

    let snapshot = ServerFrame::ConnectionEstablished {
        device_uuid: device_id.to_string(),
        timestamp: unix_timestamp(),
        data_items,
        connection_count: state.registry.count(device_id).await,
    };
    send_text(socket, snapshot.to_text(), write_timeout).await
}

/// Forward mailbox frames to the socket, pinging whenever the mailbox is
/// idle. Ends when the mailbox closes or the client stops accepting frames.
async fn send_loop<S>(
    mut sink: S,
    mut mailbox: Mailbox,
    heartbeat: Duration,
    write_timeout: Duration,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let text = match tokio::time::timeout(heartbeat, mailbox.recv()).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(connection_id = %connection_id, "Mailbox closed");
                break;
            }
            Err(_) => ServerFrame::ping().to_text(),
        };

        if let Err(failure) = send_text(&mut sink, text, write_timeout).await {
            tracing::debug!(
                connection_id = %connection_id,
                ?failure,
                "WebSocket send failed, closing connection"
            );
            break;
        }
    }
}

/// Read client frames until the socket closes. A receive timeout is not an error.
async fn recv_loop(
    mut stream: SplitStream<WebSocket>,
    dispatcher: CommandDispatcher,
    receive_timeout: Duration,
) {
    loop {
        let message = match tokio::time::timeout(receive_timeout, stream.next()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(
                    connection_id = %dispatcher.connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => dispatcher.handle_text(&text).await,
            Message::Binary(_) => {
                dispatcher
                    .reply(ServerFrame::error("Binary messages not supported"))
                    .await
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                tracing::debug!(connection_id = %dispatcher.connection_id, "Client requested close");
                break;
            }
        }
    }
}

/// Executes client commands for one connection
struct CommandDispatcher {
    state: Arc<AppState>,
    connection_id: ConnectionId,
    device_id: String,
}

impl CommandDispatcher {
    async fn handle_text(&self, text: &str) {
        let reply = match ClientCommand::parse(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Invalid client message"
                );
                ServerFrame::error(e.to_string())
            }
        };
        self.reply(reply).await;
    }

    async fn dispatch(&self, command: ClientCommand) -> ServerFrame {
        match command {
            ClientCommand::SimulationMode { name, args } => {
                let value = command_value(&args);
                match self.state.commands.send(&name, &value).await {
                    Ok(()) => ServerFrame::SimulationModeUpdated {
                        success: true,
                        value: Some(args),
                        error: None,
                        timestamp: unix_timestamp(),
                    },
                    Err(e) => {
                        tracing::warn!(device_id = %self.device_id, command = %name, error = %e, "Command failed");
                        ServerFrame::SimulationModeUpdated {
                            success: false,
                            value: None,
                            error: Some(e.to_string()),
                            timestamp: unix_timestamp(),
                        }
                    }
                }
            }
            ClientCommand::DropStream => match self.state.devices.drop_device(&self.device_id).await {
                Ok(()) => ServerFrame::StreamDropped {
                    success: true,
                    device_uuid: self.device_id.clone(),
                    timestamp: unix_timestamp(),
                },
                Err(e) => {
                    tracing::warn!(device_id = %self.device_id, error = %e, "Failed to drop stream");
                    ServerFrame::error(e.to_string())
                }
            },
            ClientCommand::Unknown(method) => ServerFrame::error(format!("Unknown method: {}", method)),
        }
    }

    async fn reply(&self, frame: ServerFrame) {
        if let Err(e) = self
            .state
            .registry
            .send_to(&self.connection_id, frame.to_text())
            .await
        {
            tracing::debug!(connection_id = %self.connection_id, error = %e, "Failed to queue reply");
        }
    }
}
