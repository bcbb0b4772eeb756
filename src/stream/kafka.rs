//! Kafka consumer backed by librdkafka.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use std::time::Duration;

use super::{ConsumerFactory, RecordConsumer, StreamError, StreamRecord};

/// Opens one `BaseConsumer` per topic worker
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    brokers: String,
}

impl KafkaConsumerFactory {
    /// Create a factory for the given bootstrap servers
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
        }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create(&self, topic: &str, group_id: &str) -> Result<Box<dyn RecordConsumer>, StreamError> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| StreamError::Consumer(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| StreamError::Consumer(e.to_string()))?;

        tracing::debug!(topic = %topic, group_id = %group_id, brokers = %self.brokers, "Kafka consumer created");
        Ok(Box::new(KafkaRecordConsumer { consumer }))
    }
}

struct KafkaRecordConsumer {
    consumer: BaseConsumer,
}

impl RecordConsumer for KafkaRecordConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<StreamRecord>, StreamError> {
        match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(StreamRecord {
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
            Some(Err(e)) => Err(StreamError::Poll(e.to_string())),
        }
    }
}
