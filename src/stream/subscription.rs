//! Topic Subscriptions
//!
//! One dedicated OS thread per subscribed topic. Each worker owns its own
//! consumer, decodes records, applies the optional key filter and hands
//! the result to the subscription's message handler.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::decode::{decode_key, decode_value};
use super::{ConsumerFactory, StreamError, StreamRecord};

/// Callback receiving `(decoded key, decoded value)` for each accepted record
pub type MessageHandler = Arc<dyn Fn(String, Value) + Send + Sync>;

/// Predicate over the decoded key; records failing it are dropped silently
pub type KeyFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Timing knobs for topic workers
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Upper bound on a single poll; also bounds stop latency
    pub poll_timeout: Duration,
    /// How long `unsubscribe` waits for a worker before abandoning it
    pub join_timeout: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Manages one background worker per subscribed topic
pub struct TopicSubscriber {
    factory: Arc<dyn ConsumerFactory>,
    workers: Mutex<HashMap<String, Worker>>,
    config: SubscriptionConfig,
}

struct Worker {
    group_id: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    // Disconnects when the worker thread exits.
    exited: Receiver<()>,
}

impl TopicSubscriber {
    /// Create a subscriber opening consumers through `factory`
    pub fn new(factory: Arc<dyn ConsumerFactory>, config: SubscriptionConfig) -> Self {
        Self {
            factory,
            workers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Start consuming `topic` unless a worker for it is already running.
    ///
    /// Returns `Ok(true)` when a new worker was spawned and `Ok(false)` when
    /// the call was a no-op.
    pub fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        on_message: MessageHandler,
        filter: Option<KeyFilter>,
    ) -> Result<bool, StreamError> {
        let mut workers = self.workers.lock();

        match workers.get(topic).map(|worker| worker.handle.is_finished()) {
            Some(false) => {
                tracing::debug!(topic = %topic, "Already subscribed to topic");
                return Ok(false);
            }
            Some(true) => {
                if let Some(dead) = workers.remove(topic) {
                    tracing::info!(topic = %topic, group_id = %dead.group_id, "Replacing exited topic worker");
                    let _ = dead.handle.join();
                }
            }
            None => {}
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = mpsc::channel();
        let context = WorkerContext {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            factory: Arc::clone(&self.factory),
            stop: Arc::clone(&stop),
            on_message,
            filter,
            poll_timeout: self.config.poll_timeout,
        };

        let handle = thread::Builder::new()
            .name(format!("topic-{}", topic))
            .spawn(move || context.run(exit_tx))
            .map_err(|e| StreamError::Spawn {
                topic: topic.to_string(),
                error: e.to_string(),
            })?;

        workers.insert(
            topic.to_string(),
            Worker {
                group_id: group_id.to_string(),
                stop,
                handle,
                exited,
            },
        );

        tracing::info!(topic = %topic, group_id = %group_id, "Subscribed to topic");
        Ok(true)
    }

    /// Stop the worker for `topic` and wait for it up to the join timeout.
    ///
    /// A worker that does not exit in time is abandoned; it still releases
    /// its consumer once its current poll returns. Returns `false` if the
    /// topic had no worker.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let Some(worker) = self.workers.lock().remove(topic) else {
            return false;
        };

        worker.stop.store(true, Ordering::Release);

        match worker.exited.recv_timeout(self.config.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    topic = %topic,
                    timeout_ms = self.config.join_timeout.as_millis() as u64,
                    "Topic worker did not stop in time, abandoning it"
                );
            }
            _ => {
                if worker.handle.join().is_err() {
                    tracing::warn!(topic = %topic, "Topic worker panicked during shutdown");
                }
                tracing::info!(topic = %topic, "Unsubscribed from topic");
            }
        }

        true
    }

    /// Stop every worker. Returns how many topics were stopped.
    pub fn unsubscribe_all(&self) -> usize {
        let topics: Vec<String> = self.workers.lock().keys().cloned().collect();
        topics.iter().filter(|topic| self.unsubscribe(topic)).count()
    }

    /// Topics whose worker thread is still running
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, worker)| !worker.handle.is_finished())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Whether `topic` currently has a running worker
    pub fn is_active(&self, topic: &str) -> bool {
        self.workers
            .lock()
            .get(topic)
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TopicSubscriber {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().values() {
            worker.stop.store(true, Ordering::Release);
        }
    }
}

struct WorkerContext {
    topic: String,
    group_id: String,
    factory: Arc<dyn ConsumerFactory>,
    stop: Arc<AtomicBool>,
    on_message: MessageHandler,
    filter: Option<KeyFilter>,
    poll_timeout: Duration,
}

impl WorkerContext {
    fn run(self, _exit: Sender<()>) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.consume()));
        if outcome.is_err() {
            tracing::error!(topic = %self.topic, "Topic worker panicked");
        }
    }

    fn consume(&self) {
        let mut consumer = match self.factory.create(&self.topic, &self.group_id) {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(topic = %self.topic, error = %e, "Failed to open topic consumer");
                return;
            }
        };

        tracing::debug!(topic = %self.topic, "Topic worker started");

        while !self.stop.load(Ordering::Acquire) {
            match consumer.poll(self.poll_timeout) {
                Ok(Some(record)) => self.handle_record(record),
                Ok(None) => {}
                Err(StreamError::Disconnected) => {
                    tracing::warn!(topic = %self.topic, "Topic consumer disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Topic poll failed");
                    thread::sleep(self.poll_timeout);
                }
            }
        }

        drop(consumer);
        tracing::debug!(topic = %self.topic, "Topic worker stopped, consumer closed");
    }

    fn handle_record(&self, record: StreamRecord) {
        let key = decode_key(record.key.as_deref());

        if let Some(filter) = &self.filter {
            if !filter(&key) {
                return;
            }
        }

        let Some(payload) = record.payload else {
            tracing::debug!(topic = %self.topic, key = %key, "Skipping record without payload");
            return;
        };

        match decode_value(&payload) {
            Some(value) => (self.on_message)(key, value),
            None => {
                tracing::debug!(topic = %self.topic, key = %key, "Skipping record with empty payload");
            }
        }
    }
}
