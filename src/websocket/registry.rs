//! Connection Registry
//!
//! Tracks live per-device connections, each with a private bounded
//! mailbox of outbound text frames. Broadcasts snapshot a device's
//! connection set under the lock and deliver after releasing it.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Receiving end of a connection's mailbox
pub type Mailbox = mpsc::Receiver<String>;

/// Configuration for the connection registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Frames buffered per connection before it is evicted
    pub mailbox_capacity: usize,
    /// Maximum number of concurrent connections across all devices
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            max_connections: 10_000,
        }
    }
}

struct ConnectionEntry {
    device_id: String,
    mailbox: mpsc::Sender<String>,
}

#[derive(Default)]
struct RegistryInner {
    /// Device id → connections attached to it
    devices: HashMap<String, HashSet<ConnectionId>>,
    /// Connection id → device and mailbox sender
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Mailboxes the frame was enqueued on
    pub delivered: usize,
    /// Connections scheduled for removal because their mailbox was full or closed
    pub evicted: usize,
}

/// Device-keyed set of live connections
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            config,
        }
    }

    /// Register a connection under `device_id`.
    ///
    /// The connection's mailbox is created together with its registry
    /// entry; the returned receiver is its only reading end.
    pub async fn register(&self, device_id: &str) -> Result<(ConnectionId, Mailbox), RegistryError> {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let id = Uuid::new_v4().to_string();

        let mut inner = self.inner.write().await;
        if inner.connections.len() >= self.config.max_connections {
            return Err(RegistryError::TooManyConnections(self.config.max_connections));
        }

        inner.connections.insert(
            id.clone(),
            ConnectionEntry {
                device_id: device_id.to_string(),
                mailbox: tx,
            },
        );
        inner
            .devices
            .entry(device_id.to_string())
            .or_default()
            .insert(id.clone());
        let count = inner.devices.get(device_id).map_or(0, HashSet::len);
        drop(inner);

        tracing::info!(
            connection_id = %id,
            device_id = %device_id,
            connections = count,
            "Connection registered"
        );
        Ok((id, rx))
    }

    /// Remove a connection and drop its mailbox.
    ///
    /// Returns `false` if the connection was already gone.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.remove(id) else {
            return false;
        };

        if let Some(set) = inner.devices.get_mut(&entry.device_id) {
            set.remove(id);
            if set.is_empty() {
                inner.devices.remove(&entry.device_id);
            }
        }
        drop(inner);

        tracing::info!(connection_id = %id, device_id = %entry.device_id, "Connection unregistered");
        true
    }

    /// Serialize `message` once and enqueue it on every connection of `device_id`.
    ///
    /// Connections whose mailbox rejects the frame are removed in the
    /// background; delivery to the others continues.
    pub async fn broadcast<T: Serialize>(&self, device_id: &str, message: &T) -> BroadcastReport {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "Failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };
        self.broadcast_text(device_id, text).await
    }

    /// Enqueue an already serialized frame on every connection of `device_id`
    pub async fn broadcast_text(&self, device_id: &str, text: String) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::Sender<String>)> = {
            let inner = self.inner.read().await;
            let Some(set) = inner.devices.get(device_id) else {
                return BroadcastReport::default();
            };
            set.iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|entry| (id.clone(), entry.mailbox.clone()))
                })
                .collect()
        };

        let mut report = BroadcastReport::default();
        for (id, mailbox) in targets {
            match mailbox.try_send(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        device_id = %device_id,
                        reason = %e,
                        "Evicting connection"
                    );
                    report.evicted += 1;
                    let registry = self.clone();
                    tokio::spawn(async move {
                        registry.unregister(&id).await;
                    });
                }
            }
        }

        if report.delivered > 0 {
            tracing::trace!(device_id = %device_id, delivered = report.delivered, "Broadcast update");
        }
        report
    }

    /// Enqueue a frame on a single connection's mailbox
    pub async fn send_to(&self, id: &str, text: String) -> Result<(), RegistryError> {
        let mailbox = {
            let inner = self.inner.read().await;
            inner
                .connections
                .get(id)
                .map(|entry| entry.mailbox.clone())
                .ok_or(RegistryError::ConnectionNotFound)?
        };

        mailbox.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => RegistryError::MailboxClosed,
        })
    }

    /// Live connections attached to `device_id`
    pub async fn count(&self, device_id: &str) -> usize {
        self.inner
            .read()
            .await
            .devices
            .get(device_id)
            .map_or(0, HashSet::len)
    }

    /// Live connections across all devices
    pub async fn total_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Devices with at least one live connection
    pub async fn device_count(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    /// Whether a connection is currently registered
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.connections.contains_key(id)
    }
}

/// Errors that can occur in the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error("Connection mailbox is full")]
    MailboxFull,

    #[error("Connection mailbox is closed")]
    MailboxClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryConfig::default())
    }

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.mailbox_capacity, 256);
        assert_eq!(config.max_connections, 10_000);
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = registry();

        let (id, _rx) = registry.register("IVAC").await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(registry.count("IVAC").await, 1);
        assert_eq!(registry.total_count().await, 1);

        assert!(registry.unregister(&id).await);
        assert_eq!(registry.count("IVAC").await, 0);
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = registry();
        let (id, mut rx) = registry.register("IVAC").await.unwrap();

        assert!(registry.unregister(&id).await);
        assert!(!registry.unregister(&id).await);
        assert!(!registry.unregister("never-registered").await);

        // The mailbox closed exactly once.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            mailbox_capacity: 4,
            max_connections: 2,
        });

        let (id1, _rx1) = registry.register("A").await.unwrap();
        let (_id2, _rx2) = registry.register("B").await.unwrap();
        let result = registry.register("A").await;
        assert!(matches!(result, Err(RegistryError::TooManyConnections(2))));

        registry.unregister(&id1).await;
        assert!(registry.register("A").await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_target_device() {
        let registry = registry();

        let (_a1, mut rx_a1) = registry.register("A").await.unwrap();
        let (_a2, mut rx_a2) = registry.register("A").await.unwrap();
        let (_b1, mut rx_b1) = registry.register("B").await.unwrap();

        let report = registry.broadcast("A", &json!({"asset_uuid": "A"})).await;
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 0 });

        assert_eq!(rx_a1.try_recv().unwrap(), r#"{"asset_uuid":"A"}"#);
        assert_eq!(rx_a2.try_recv().unwrap(), r#"{"asset_uuid":"A"}"#);
        assert!(rx_b1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_device() {
        let registry = registry();
        let report = registry.broadcast("nobody", &json!({})).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_full_mailbox_is_evicted() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            mailbox_capacity: 1,
            max_connections: 10,
        });

        let (slow, _slow_rx) = registry.register("A").await.unwrap();
        let (_fast, mut fast_rx) = registry.register("A").await.unwrap();

        registry.broadcast_text("A", "1".to_string()).await;
        fast_rx.recv().await.unwrap();

        let report = registry.broadcast_text("A", "2".to_string()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(fast_rx.recv().await.unwrap(), "2");

        // Removal happens on a spawned task.
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.contains(&slow).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.count("A").await, 1);
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_evicted() {
        let registry = registry();
        let (id, rx) = registry.register("A").await.unwrap();
        drop(rx);

        let report = registry.broadcast_text("A", "x".to_string()).await;
        assert_eq!(report.evicted, 1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.contains(&id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_send_to() {
        let registry = registry();
        let (id, mut rx) = registry.register("A").await.unwrap();

        registry.send_to(&id, "hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");

        let missing = registry.send_to("missing", "x".to_string()).await;
        assert!(matches!(missing, Err(RegistryError::ConnectionNotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister() {
        let registry = registry();
        let devices = ["A", "B", "C", "D"];

        let mut handles = Vec::new();
        for task in 0..32 {
            let registry = registry.clone();
            let device = devices[task % devices.len()];
            handles.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for round in 0..50 {
                    let (id, rx) = registry.register(device).await.unwrap();
                    if round % 5 == 0 {
                        kept.push((id, rx));
                    } else {
                        assert!(registry.unregister(&id).await);
                    }
                }
                kept
            }));
        }

        let mut kept = Vec::new();
        for handle in handles {
            kept.extend(handle.await.unwrap());
        }

        // Every surviving connection belongs to exactly one device set.
        let inner = registry.inner.read().await;
        assert_eq!(inner.connections.len(), kept.len());
        for (id, _) in &kept {
            let memberships = inner.devices.values().filter(|set| set.contains(id)).count();
            assert_eq!(memberships, 1);
            let device = &inner.connections[id].device_id;
            assert!(inner.devices[device].contains(id));
        }
        let total: usize = inner.devices.values().map(HashSet::len).sum();
        assert_eq!(total, kept.len());
    }
}
