//! In-Process Broker
//!
//! A [`ConsumerFactory`] that keeps topics in memory. Every consumer opened
//! on a topic receives every record published to it after it was opened,
//! matching `auto.offset.reset=latest`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::{ConsumerFactory, RecordConsumer, StreamError, StreamRecord};

/// In-memory topic broker
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
}

#[derive(Default)]
struct TopicState {
    consumers: Vec<Sender<StreamRecord>>,
    created: usize,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a record to every open consumer of `topic`.
    ///
    /// Returns the number of consumers that received it.
    pub fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> usize {
        self.publish_record(topic, StreamRecord::new(key, payload))
    }

    /// Publish an already-built record
    pub fn publish_record(&self, topic: &str, record: StreamRecord) -> usize {
        let mut topics = self.topics.lock();
        let Some(state) = topics.get_mut(topic) else {
            return 0;
        };
        state
            .consumers
            .retain(|consumer| consumer.send(record.clone()).is_ok());
        state.consumers.len()
    }

    /// How many consumers were ever created for `topic`
    pub fn consumers_created(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|state| state.created)
            .unwrap_or(0)
    }
}

impl ConsumerFactory for MemoryBroker {
    fn create(&self, topic: &str, _group_id: &str) -> Result<Box<dyn RecordConsumer>, StreamError> {
        let (tx, rx) = mpsc::channel();
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.consumers.push(tx);
        state.created += 1;
        Ok(Box::new(MemoryConsumer { records: rx }))
    }
}

struct MemoryConsumer {
    records: Receiver<StreamRecord>,
}

impl RecordConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<StreamRecord>, StreamError> {
        match self.records.recv_timeout(timeout) {
            Ok(record) => Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_open_consumers() {
        let broker = MemoryBroker::new();
        let mut a = broker.create("t", "g1").unwrap();
        let mut b = broker.create("t", "g2").unwrap();

        assert_eq!(broker.publish("t", b"k", b"{}"), 2);

        let timeout = Duration::from_millis(50);
        assert!(a.poll(timeout).unwrap().is_some());
        assert!(b.poll(timeout).unwrap().is_some());
        assert!(a.poll(timeout).unwrap().is_none());
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("missing", b"k", b"{}"), 0);
        assert_eq!(broker.consumers_created("missing"), 0);
    }

    #[test]
    fn test_dropped_consumer_is_pruned() {
        let broker = MemoryBroker::new();
        let consumer = broker.create("t", "g").unwrap();
        assert_eq!(broker.consumers_created("t"), 1);
        drop(consumer);
        assert_eq!(broker.publish("t", b"k", b"{}"), 0);
    }
}
