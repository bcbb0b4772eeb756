//! Bridge Pump
//!
//! Single async task moving decoded records from the [`HandoffQueue`]
//! into [`ConnectionRegistry`] broadcasts.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::handoff::{Handoff, HandoffQueue};
use crate::services::DeviceDirectory;
use crate::websocket::{ConnectionRegistry, UpdateFrame};

/// Pump configuration
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Sleep between drain passes
    pub interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
        }
    }
}

/// Drains the handoff queue, enriches each update and broadcasts it
pub struct BridgePump {
    queue: Arc<HandoffQueue>,
    registry: ConnectionRegistry,
    directory: Arc<dyn DeviceDirectory>,
    config: PumpConfig,
}

impl BridgePump {
    pub fn new(
        queue: Arc<HandoffQueue>,
        registry: ConnectionRegistry,
        directory: Arc<dyn DeviceDirectory>,
        config: PumpConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            directory,
            config,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.config.interval.as_millis() as u64, "Bridge pump started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.pump_once().await;
        }

        tracing::info!("Bridge pump stopped");
    }

    /// Drain everything queued right now and broadcast it. Returns the
    /// number of updates processed.
    pub async fn pump_once(&self) -> usize {
        let batch = self.queue.drain();
        let processed = batch.len();

        for item in batch {
            self.forward(item).await;
        }

        processed
    }

    async fn forward(&self, item: Handoff) {
        let Handoff { device_id, value } = item;
        let mut data = into_data(value);

        // Runs whether or not the device currently has connections.
        if let Err(e) = self.directory.enrich(&device_id, &mut data).await {
            tracing::warn!(device_id = %device_id, error = %e, "Enrichment failed, forwarding update as is");
        }

        let frame = UpdateFrame::new(device_id.as_str(), data);
        let report = self.registry.broadcast(&device_id, &frame).await;
        tracing::trace!(
            device_id = %device_id,
            delivered = report.delivered,
            evicted = report.evicted,
            "Pumped update"
        );
    }
}

/// Shape a decoded record value into the `data` object of an update
fn into_data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::String(text) => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(text));
            map
        }
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceError;
    use crate::websocket::RegistryConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingDirectory {
        enriched: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl DeviceDirectory for RecordingDirectory {
        async fn list_devices(&self) -> Result<Vec<String>, ServiceError> {
            Ok(Vec::new())
        }

        async fn data_items(&self, _device_id: &str) -> Result<Map<String, Value>, ServiceError> {
            Ok(Map::new())
        }

        async fn duration_stats(&self, _device_id: &str) -> Result<Map<String, Value>, ServiceError> {
            Ok(Map::new())
        }

        async fn enrich(&self, device_id: &str, data: &mut Map<String, Value>) -> Result<(), ServiceError> {
            self.enriched.lock().push(device_id.to_string());
            if self.fail {
                return Err(ServiceError::Unavailable);
            }
            data.insert("durations".to_string(), json!({"ON": 1.0}));
            Ok(())
        }
    }

    fn pump(directory: Arc<RecordingDirectory>) -> (BridgePump, Arc<HandoffQueue>, ConnectionRegistry) {
        let queue = Arc::new(HandoffQueue::new(16));
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let pump = BridgePump::new(
            Arc::clone(&queue),
            registry.clone(),
            directory,
            PumpConfig::default(),
        );
        (pump, queue, registry)
    }

    #[test]
    fn test_into_data() {
        let object = into_data(json!({"ID": "Tool1"}));
        assert_eq!(object["ID"], "Tool1");

        let raw = into_data(json!("not json at all"));
        assert_eq!(raw["raw"], "not json at all");

        let number = into_data(json!(42));
        assert_eq!(number["value"], 42);
    }

    #[tokio::test]
    async fn test_pump_once_broadcasts_update() {
        let directory = Arc::new(RecordingDirectory::default());
        let (pump, queue, registry) = pump(Arc::clone(&directory));
        let (_id, mut mailbox) = registry.register("IVAC").await.unwrap();

        queue.push(Handoff {
            device_id: "IVAC".to_string(),
            value: json!({"ID": "Tool1", "VALUE": "ON", "TIMESTAMP": "T"}),
        });

        assert_eq!(pump.pump_once().await, 1);

        let text = mailbox.try_recv().unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["asset_uuid"], "IVAC");
        assert_eq!(frame["data"]["ID"], "Tool1");
        assert_eq!(frame["data"]["VALUE"], "ON");
        assert_eq!(frame["data"]["durations"]["ON"], 1.0);
        assert!(frame["timestamp"].is_number());

        assert!(mailbox.try_recv().is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pump_drains_whole_burst() {
        let directory = Arc::new(RecordingDirectory::default());
        let (pump, queue, registry) = pump(Arc::clone(&directory));
        let (_id, mut mailbox) = registry.register("A").await.unwrap();

        for i in 0..5 {
            queue.push(Handoff {
                device_id: "A".to_string(),
                value: json!({"ID": "x", "VALUE": i}),
            });
        }

        assert_eq!(pump.pump_once().await, 5);
        for i in 0..5 {
            let frame: Value = serde_json::from_str(&mailbox.try_recv().unwrap()).unwrap();
            assert_eq!(frame["data"]["VALUE"], i);
        }
    }

    #[tokio::test]
    async fn test_enrichment_failure_still_broadcasts() {
        let directory = Arc::new(RecordingDirectory {
            fail: true,
            ..Default::default()
        });
        let (pump, queue, registry) = pump(Arc::clone(&directory));
        let (_id, mut mailbox) = registry.register("IVAC").await.unwrap();

        queue.push(Handoff {
            device_id: "IVAC".to_string(),
            value: json!({"ID": "Tool1"}),
        });
        pump.pump_once().await;

        let frame: Value = serde_json::from_str(&mailbox.try_recv().unwrap()).unwrap();
        assert_eq!(frame["data"]["ID"], "Tool1");
        assert!(frame["data"].get("durations").is_none());
    }

    #[tokio::test]
    async fn test_enriches_devices_without_connections() {
        let directory = Arc::new(RecordingDirectory::default());
        let (pump, queue, _registry) = pump(Arc::clone(&directory));

        queue.push(Handoff {
            device_id: "LONELY".to_string(),
            value: json!({"ID": "x"}),
        });
        pump.pump_once().await;

        assert_eq!(directory.enriched.lock().as_slice(), ["LONELY".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let directory = Arc::new(RecordingDirectory::default());
        let (pump, queue, registry) = pump(directory);
        let (_id, mut mailbox) = registry.register("A").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump.run(cancel.clone()));

        queue.push(Handoff {
            device_id: "A".to_string(),
            value: json!({"ID": "x"}),
        });
        let text = tokio::time::timeout(Duration::from_secs(1), mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains(r#""asset_uuid":"A""#));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
