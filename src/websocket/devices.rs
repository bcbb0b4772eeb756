//! Device Sessions
//!
//! Per-device provisioning state shared by every connection to that
//! device. A session is initialized lazily on first connection and only
//! torn down by an explicit drop.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::GatewayError;
use crate::services::StreamProvisioner;
use crate::stream::{Handoff, HandoffQueue, KeyFilter, MessageHandler, TopicSubscriber};

/// Provisioning state of one device
#[derive(Debug, Clone, Default)]
pub struct DeviceSession {
    /// Backing topic of the derived stream, once provisioned
    pub stream_topic: Option<String>,
    pub initialized: bool,
}

/// Table of device sessions plus what is needed to (de)initialize them
pub struct DeviceSessions {
    sessions: Mutex<HashMap<String, Arc<Mutex<DeviceSession>>>>,
    provisioner: Arc<dyn StreamProvisioner>,
    subscriber: Arc<TopicSubscriber>,
    handoff: Arc<HandoffQueue>,
    group_prefix: String,
}

impl DeviceSessions {
    pub fn new(
        provisioner: Arc<dyn StreamProvisioner>,
        subscriber: Arc<TopicSubscriber>,
        handoff: Arc<HandoffQueue>,
        group_prefix: impl Into<String>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            provisioner,
            subscriber,
            handoff,
            group_prefix: group_prefix.into(),
        }
    }

    async fn cell(&self, device_id: &str) -> Arc<Mutex<DeviceSession>> {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(device_id.to_string()).or_default())
    }

    /// Remove a never-initialized entry nobody else is holding
    async fn forget(&self, device_id: &str, cell: Arc<Mutex<DeviceSession>>) {
        let mut sessions = self.sessions.lock().await;
        let unshared = sessions
            .get(device_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &cell) && Arc::strong_count(&cell) == 2);
        if unshared {
            sessions.remove(device_id);
        }
    }

    /// Consumer group used for a device's topic worker
    pub fn group_id(&self, device_id: &str) -> String {
        format!("{}_{}", self.group_prefix, device_id)
    }

    /// Provision and subscribe the device's derived stream unless already done.
    ///
    /// Concurrent first connections to the same device provision once. On
    /// failure the session is forgotten so the next connection retries. An
    /// initialized session whose topic worker has exited is resubscribed.
    pub async fn ensure_initialized(&self, device_id: &str) -> Result<(), GatewayError> {
        let cell = self.cell(device_id).await;
        let mut session = cell.lock().await;

        if session.initialized {
            if let Some(topic) = session.stream_topic.as_deref() {
                if !self.subscriber.is_active(topic) {
                    tracing::warn!(device_id = %device_id, topic = %topic, "Topic worker exited, resubscribing");
                    self.subscribe_topic(device_id, topic)?;
                }
            }
            return Ok(());
        }

        let result = self.initialize(device_id, &mut session).await;
        if result.is_err() {
            drop(session);
            self.forget(device_id, cell).await;
        }
        result
    }

    async fn initialize(&self, device_id: &str, session: &mut DeviceSession) -> Result<(), GatewayError> {
        let topic = self
            .provisioner
            .provision(device_id)
            .await
            .map_err(|e| GatewayError::Provisioning {
                device_id: device_id.to_string(),
                source: e,
            })?;

        self.subscribe_topic(device_id, &topic)?;
        tracing::info!(device_id = %device_id, topic = %topic, "Device session initialized");

        session.stream_topic = Some(topic);
        session.initialized = true;
        Ok(())
    }

    /// Start (or restart) the worker feeding this device's records into the handoff queue
    fn subscribe_topic(&self, device_id: &str, topic: &str) -> Result<bool, GatewayError> {
        let group_id = self.group_id(device_id);
        let handoff = Arc::clone(&self.handoff);
        let on_message: MessageHandler = Arc::new(move |key, value| {
            handoff.push(Handoff {
                device_id: key,
                value,
            });
        });
        let expected = device_id.to_string();
        let filter: KeyFilter = Arc::new(move |key| key == expected);

        let spawned = self
            .subscriber
            .subscribe(topic, &group_id, on_message, Some(filter))
            .map_err(GatewayError::Subscribe)?;

        tracing::debug!(
            device_id = %device_id,
            topic = %topic,
            group_id = %group_id,
            new_worker = spawned,
            "Subscribed device topic"
        );
        Ok(spawned)
    }

    /// Drop the derived stream, stop its topic worker and reset the session
    pub async fn drop_device(&self, device_id: &str) -> Result<(), GatewayError> {
        let cell = self.cell(device_id).await;
        let mut session = cell.lock().await;

        self.provisioner
            .deprovision(device_id)
            .await
            .map_err(|e| GatewayError::Provisioning {
                device_id: device_id.to_string(),
                source: e,
            })?;

        if let Some(topic) = session.stream_topic.take() {
            let subscriber = Arc::clone(&self.subscriber);
            let stopped = tokio::task::spawn_blocking(move || subscriber.unsubscribe(&topic))
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            tracing::debug!(device_id = %device_id, stopped, "Unsubscribed device topic");
        }

        *session = DeviceSession::default();

        tracing::info!(device_id = %device_id, "Device session dropped");
        Ok(())
    }

    /// Current state of a device's session, if one exists
    pub async fn get(&self, device_id: &str) -> Option<DeviceSession> {
        let cell = self.sessions.lock().await.get(device_id).cloned()?;
        let session = cell.lock().await;
        Some(session.clone())
    }

    /// Number of initialized device sessions
    pub async fn initialized_count(&self) -> usize {
        let cells: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        let mut count = 0;
        for cell in cells {
            if cell.lock().await.initialized {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceError;
    use crate::stream::{ConsumerFactory, MemoryBroker, RecordConsumer, StreamError, SubscriptionConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProvisioner {
        provisioned: AtomicUsize,
        deprovisioned: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl StreamProvisioner for CountingProvisioner {
        async fn provision(&self, device_id: &str) -> Result<String, ServiceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ServiceError::Provision {
                    device_id: device_id.to_string(),
                    reason: "ksqlDB down".to_string(),
                });
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}_monitoring", device_id))
        }

        async fn deprovision(&self, _device_id: &str) -> Result<(), ServiceError> {
            self.deprovisioned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Every consumer it opens fails immediately, so workers exit right away
    #[derive(Default)]
    struct UnreachableBroker {
        created: AtomicUsize,
    }

    impl ConsumerFactory for UnreachableBroker {
        fn create(&self, _topic: &str, _group_id: &str) -> Result<Box<dyn RecordConsumer>, StreamError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::Consumer("broker unreachable".to_string()))
        }
    }

    fn sessions(provisioner: Arc<CountingProvisioner>) -> (Arc<DeviceSessions>, Arc<MemoryBroker>, Arc<HandoffQueue>) {
        let broker = Arc::new(MemoryBroker::new());
        let (sessions, handoff) = sessions_with(provisioner, broker.clone());
        (sessions, broker, handoff)
    }

    fn sessions_with(
        provisioner: Arc<CountingProvisioner>,
        factory: Arc<dyn ConsumerFactory>,
    ) -> (Arc<DeviceSessions>, Arc<HandoffQueue>) {
        let subscriber = Arc::new(TopicSubscriber::new(
            factory,
            SubscriptionConfig {
                poll_timeout: Duration::from_millis(20),
                join_timeout: Duration::from_secs(2),
            },
        ));
        let handoff = Arc::new(HandoffQueue::new(64));
        let sessions = Arc::new(DeviceSessions::new(
            provisioner,
            subscriber,
            Arc::clone(&handoff),
            "test_group",
        ));
        (sessions, handoff)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_first_connections_provision_once() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let (sessions, _broker, _handoff) = sessions(Arc::clone(&provisioner));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sessions = Arc::clone(&sessions);
            handles.push(tokio::spawn(async move { sessions.ensure_initialized("IVAC").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);
        let session = sessions.get("IVAC").await.unwrap();
        assert!(session.initialized);
        assert_eq!(session.stream_topic.as_deref(), Some("IVAC_monitoring"));
        assert_eq!(sessions.initialized_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_records_for_device_reach_handoff() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let (sessions, broker, handoff) = sessions(provisioner);
        sessions.ensure_initialized("IVAC").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.consumers_created("IVAC_monitoring") == 0 {
            assert!(tokio::time::Instant::now() < deadline, "consumer never opened");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        broker.publish("IVAC_monitoring", b"OTHER", br#"{"ID":"x"}"#);
        broker.publish("IVAC_monitoring", b"IVAC", br#"{"ID":"Tool1","VALUE":"ON"}"#);

        while handoff.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "record never handed off");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let items = handoff.drain();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].device_id, "IVAC");
        assert_eq!(items[0].value["VALUE"], "ON");
    }

    #[tokio::test]
    async fn test_provisioning_failure_forgets_session_and_retries() {
        let provisioner = Arc::new(CountingProvisioner::default());
        provisioner.fail.store(true, Ordering::SeqCst);
        let (sessions, _broker, _handoff) = sessions(Arc::clone(&provisioner));

        let err = sessions.ensure_initialized("IVAC").await.unwrap_err();
        assert!(matches!(err, GatewayError::Provisioning { .. }));
        assert!(sessions.get("IVAC").await.is_none());

        provisioner.fail.store(false, Ordering::SeqCst);
        sessions.ensure_initialized("IVAC").await.unwrap();
        assert!(sessions.get("IVAC").await.unwrap().initialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_then_reinitialize_provisions_again() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let (sessions, _broker, _handoff) = sessions(Arc::clone(&provisioner));

        sessions.ensure_initialized("IVAC").await.unwrap();
        sessions.drop_device("IVAC").await.unwrap();
        assert!(!sessions.get("IVAC").await.unwrap().initialized);
        assert_eq!(provisioner.deprovisioned.load(Ordering::SeqCst), 1);

        sessions.ensure_initialized("IVAC").await.unwrap();
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_initialization_does_not_accumulate_sessions() {
        let provisioner = Arc::new(CountingProvisioner::default());
        provisioner.fail.store(true, Ordering::SeqCst);
        let (sessions, _broker, _handoff) = sessions(provisioner);

        for i in 0..50 {
            let device_id = format!("bogus-{}", i);
            assert!(sessions.ensure_initialized(&device_id).await.is_err());
        }

        assert!(sessions.sessions.lock().await.is_empty());
        assert_eq!(sessions.initialized_count().await, 0);
    }

    #[test]
    fn test_group_id_joins_prefix_and_device() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let (sessions, _broker, _handoff) = sessions(provisioner);
        assert_eq!(sessions.group_id("IVAC"), "test_group_IVAC");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exited_worker_is_resubscribed_on_next_connection() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let factory = Arc::new(UnreachableBroker::default());
        let (sessions, _handoff) = sessions_with(Arc::clone(&provisioner), factory.clone());

        sessions.ensure_initialized("IVAC").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sessions.subscriber.is_active("IVAC_monitoring") {
            assert!(tokio::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        sessions.ensure_initialized("IVAC").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while factory.created.load(Ordering::SeqCst) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "worker was not restarted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);
        assert!(sessions.get("IVAC").await.unwrap().initialized);
    }
}
