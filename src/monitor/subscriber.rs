//! Per-device reconnecting subscriptions to the gateway.
//!
//! Every device id gets its own task and its own child cancellation token,
//! so a device that gives up (or is stopped) never touches its siblings.
//! All loops feed one [`FrameSink`].

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::directory::device_url;
use super::sink::{DeviceFrame, FrameSink};
use super::MonitorError;
use crate::config::MonitorConfig;

/// How a device loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Cancelled,
    /// Bounded policy ran out of attempts
    Exhausted { attempts: u32 },
}

/// Settings shared by every device loop
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl SubscriberConfig {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            url: config.url.clone(),
            backoff: BackoffPolicy::from_config(config),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

struct DeviceLoop {
    cancel: CancellationToken,
    handle: JoinHandle<MonitorOutcome>,
}

pub struct ReconnectingSubscriber {
    config: Arc<SubscriberConfig>,
    sink: FrameSink,
    cancel: CancellationToken,
    loops: Mutex<HashMap<String, DeviceLoop>>,
}

impl ReconnectingSubscriber {
    pub fn new(config: SubscriberConfig, sink: FrameSink) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            cancel: CancellationToken::new(),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Start a loop for every device not already being monitored.
    ///
    /// Returns the number of loops started.
    pub fn start<I, S>(&self, devices: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut loops = self.loops.lock();
        let mut started = 0;

        for device_id in devices {
            let device_id = device_id.into();
            if loops.contains_key(&device_id) {
                continue;
            }

            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(run_device(
                device_id.clone(),
                Arc::clone(&self.config),
                self.sink.clone(),
                cancel.clone(),
            ));
            loops.insert(device_id, DeviceLoop { cancel, handle });
            started += 1;
        }

        started
    }

    /// Devices whose loop is still running
    pub fn active_devices(&self) -> Vec<String> {
        let mut devices: Vec<_> = self
            .loops
            .lock()
            .iter()
            .filter(|(_, l)| !l.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Stop one device's loop, leaving the others running
    pub async fn stop(&self, device_id: &str) -> Option<MonitorOutcome> {
        let device_loop = self.loops.lock().remove(device_id)?;
        device_loop.cancel.cancel();
        join_loop(device_id, device_loop.handle).await
    }

    /// Cancel every loop and wait for all of them to finish
    pub async fn shutdown(&self) -> HashMap<String, MonitorOutcome> {
        self.cancel.cancel();
        let loops: Vec<_> = self.loops.lock().drain().collect();

        let mut outcomes = HashMap::with_capacity(loops.len());
        for (device_id, device_loop) in loops {
            if let Some(outcome) = join_loop(&device_id, device_loop.handle).await {
                outcomes.insert(device_id, outcome);
            }
        }
        outcomes
    }
}

async fn join_loop(device_id: &str, handle: JoinHandle<MonitorOutcome>) -> Option<MonitorOutcome> {
    match handle.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::warn!(device_id = %device_id, error = %e, "Device loop did not finish cleanly");
            None
        }
    }
}

async fn run_device(
    device_id: String,
    config: Arc<SubscriberConfig>,
    sink: FrameSink,
    cancel: CancellationToken,
) -> MonitorOutcome {
    let url = device_url(&config.url, &device_id);
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            () = cancel.cancelled() => return MonitorOutcome::Cancelled,
            result = timeout(config.connect_timeout, tokio_tungstenite::connect_async(url.as_str())) => result,
        };

        match connected {
            Ok(Ok((ws, _))) => {
                attempt = 0;
                tracing::info!(device_id = %device_id, "Connected to device stream");

                let ended = tokio::select! {
                    () = cancel.cancelled() => return MonitorOutcome::Cancelled,
                    ended = stream_frames(ws, &device_id, config.idle_timeout, &sink) => ended,
                };
                match ended {
                    Ok(()) => tracing::info!(device_id = %device_id, "Device stream closed"),
                    Err(e) => tracing::warn!(device_id = %device_id, error = %e, "Device stream lost"),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(device_id = %device_id, error = %e, "Connection failed");
            }
            Err(_) => {
                tracing::warn!(
                    device_id = %device_id,
                    timeout_ms = config.connect_timeout.as_millis() as u64,
                    "Connection timed out"
                );
            }
        }

        attempt = attempt.saturating_add(1);
        if config.backoff.exhausted(attempt) {
            tracing::error!(device_id = %device_id, attempts = attempt, "Giving up on device");
            return MonitorOutcome::Exhausted { attempts: attempt };
        }

        let delay = config.backoff.delay(attempt);
        tracing::debug!(
            device_id = %device_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => return MonitorOutcome::Cancelled,
        }
    }
}

async fn stream_frames<S>(
    mut ws: S,
    device_id: &str,
    idle: Duration,
    sink: &FrameSink,
) -> Result<(), MonitorError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = match timeout(idle, ws.next()).await {
            Ok(Some(msg)) => msg?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(MonitorError::Timeout(idle)),
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(payload) => {
                    sink.deliver(DeviceFrame {
                        device_id: device_id.to_string(),
                        payload,
                    });
                }
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "Skipping undecodable frame");
                }
            },
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::monitor::backoff::Termination;
    use crate::monitor::sink::frame_channel;
    use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts every device except "BAD"; sends one update per connection
    /// then closes.
    async fn spawn_gateway(connections: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/ws/devices/:device_id",
            get(move |ws: WebSocketUpgrade, Path(device_id): Path<String>| {
                let connections = Arc::clone(&connections);
                async move {
                    if device_id == "BAD" {
                        return StatusCode::NOT_FOUND.into_response();
                    }
                    let n = connections.fetch_add(1, Ordering::SeqCst);
                    ws.on_upgrade(move |mut socket| async move {
                        let update = serde_json::json!({
                            "asset_uuid": device_id,
                            "data": {"ID": "Tool1", "VALUE": n},
                            "timestamp": 1.0,
                        });
                        let _ = socket.send(AxumMessage::Text("{oops".to_string())).await;
                        let _ = socket.send(AxumMessage::Text(update.to_string())).await;
                        let _ = socket.send(AxumMessage::Close(None)).await;
                    })
                    .into_response()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}/ws", addr)
    }

    fn config(url: String, termination: Termination) -> SubscriberConfig {
        SubscriberConfig {
            url,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                termination,
            },
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_config_from_monitor_config() {
        let mut monitor = MonitorConfig::default();
        monitor.policy = RetryPolicy::Unbounded;
        let config = SubscriberConfig::from_config(&monitor);
        assert_eq!(config.backoff.termination, Termination::Unbounded);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_reconnects_and_feeds_sink() {
        let connections = Arc::new(AtomicUsize::new(0));
        let url = spawn_gateway(Arc::clone(&connections)).await;
        let (sink, mut rx) = frame_channel(64);
        let subscriber = ReconnectingSubscriber::new(config(url, Termination::Unbounded), sink);

        assert_eq!(subscriber.start(["IVAC", "IVAC"]), 1);
        assert_eq!(subscriber.start(["IVAC"]), 0);

        for _ in 0..3 {
            let frame = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(frame.device_id, "IVAC");
            assert_eq!(frame.payload["asset_uuid"], "IVAC");
        }
        assert!(connections.load(Ordering::SeqCst) >= 3);

        let outcomes = subscriber.shutdown().await;
        assert_eq!(outcomes.get("IVAC"), Some(&MonitorOutcome::Cancelled));
        assert!(subscriber.active_devices().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_exhaustion_leaves_siblings_running() {
        let connections = Arc::new(AtomicUsize::new(0));
        let url = spawn_gateway(Arc::clone(&connections)).await;
        let (sink, mut rx) = frame_channel(256);
        let subscriber = ReconnectingSubscriber::new(
            config(url, Termination::Bounded { max_attempts: 2 }),
            sink,
        );

        assert_eq!(subscriber.start(["BAD", "GOOD"]), 2);
        wait_until(|| subscriber.active_devices() == vec!["GOOD".to_string()]).await;

        // GOOD still delivers after BAD gave up
        let seen = connections.load(Ordering::SeqCst);
        wait_until(|| connections.load(Ordering::SeqCst) > seen + 1).await;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.device_id, "GOOD");
        }

        let outcomes = subscriber.shutdown().await;
        assert_eq!(outcomes.get("BAD"), Some(&MonitorOutcome::Exhausted { attempts: 2 }));
        assert_eq!(outcomes.get("GOOD"), Some(&MonitorOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_single_device() {
        let connections = Arc::new(AtomicUsize::new(0));
        let url = spawn_gateway(connections).await;
        let (sink, _rx) = frame_channel(256);
        let subscriber = ReconnectingSubscriber::new(config(url, Termination::Unbounded), sink);

        subscriber.start(["A", "B"]);
        assert_eq!(subscriber.stop("A").await, Some(MonitorOutcome::Cancelled));
        assert_eq!(subscriber.stop("A").await, None);
        assert_eq!(subscriber.active_devices(), vec!["B".to_string()]);

        let outcomes = subscriber.shutdown().await;
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_exhausts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (sink, _rx) = frame_channel(8);
        let subscriber = ReconnectingSubscriber::new(
            config(format!("ws://{}/ws", addr), Termination::Bounded { max_attempts: 3 }),
            sink,
        );
        subscriber.start(["IVAC"]);
        wait_until(|| subscriber.active_devices().is_empty()).await;

        let outcomes = subscriber.shutdown().await;
        assert_eq!(outcomes.get("IVAC"), Some(&MonitorOutcome::Exhausted { attempts: 3 }));
    }
}
