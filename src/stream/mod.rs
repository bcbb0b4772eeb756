//! Event-Stream Bridge
//!
//! Everything between the partitioned event-stream platform and the
//! cooperative gateway runtime.
//!
//! ## Architecture
//!
//! - **TopicSubscriber**: one blocking OS thread per subscribed topic
//! - **HandoffQueue**: the only channel crossing from those threads into
//!   the async runtime (many producers, one consumer, drop-oldest)
//! - **BridgePump**: a single async task draining the queue into
//!   [`ConnectionRegistry::broadcast`](crate::websocket::ConnectionRegistry::broadcast)
//!
//! The platform itself sits behind [`ConsumerFactory`] / [`RecordConsumer`].
//! [`MemoryBroker`] is an in-process implementation; the librdkafka one lives
//! behind the `kafka` feature.

mod decode;
mod handoff;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod pump;
mod subscription;

pub use decode::{decode_key, decode_value, UNKNOWN_KEY};
pub use handoff::{Handoff, HandoffQueue};
#[cfg(feature = "kafka")]
pub use kafka::KafkaConsumerFactory;
pub use memory::MemoryBroker;
pub use pump::{BridgePump, PumpConfig};
pub use subscription::{KeyFilter, MessageHandler, SubscriptionConfig, TopicSubscriber};

use std::time::Duration;
use thiserror::Error;

/// A raw record as read from a topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRecord {
    /// Record key bytes (the device id on derived streams)
    pub key: Option<Vec<u8>>,
    /// Record value bytes (JSON on derived streams)
    pub payload: Option<Vec<u8>>,
}

impl StreamRecord {
    /// Create a record from key and payload bytes
    pub fn new(key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            payload: Some(payload.into()),
        }
    }
}

/// A blocking consumer bound to one topic and consumer group.
///
/// Dropping the consumer must release its platform resources.
pub trait RecordConsumer: Send {
    /// Wait at most `timeout` for the next record.
    fn poll(&mut self, timeout: Duration) -> Result<Option<StreamRecord>, StreamError>;
}

/// Creates consumers for topic workers
pub trait ConsumerFactory: Send + Sync {
    /// Open a consumer on `topic` within consumer group `group_id`.
    fn create(&self, topic: &str, group_id: &str) -> Result<Box<dyn RecordConsumer>, StreamError>;
}

/// Errors raised by the stream platform adapter
#[derive(Debug, Error)]
pub enum StreamError {
    /// Creating or configuring a consumer failed
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// A poll on an open consumer failed
    #[error("Poll error: {0}")]
    Poll(String),

    /// The consumer's source went away
    #[error("Consumer disconnected")]
    Disconnected,

    /// Spawning the worker thread failed
    #[error("Failed to spawn worker for {topic}: {error}")]
    Spawn { topic: String, error: String },
}
