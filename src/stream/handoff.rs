//! Handoff Queue
//!
//! The sole crossing point from blocking topic workers into the async
//! runtime. Producers never block: when the queue is full the oldest
//! item is discarded.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A decoded record waiting to be broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    /// Device the record belongs to (the decoded record key)
    pub device_id: String,
    /// Decoded record value
    pub value: Value,
}

/// Bounded multi-producer, single-consumer queue with drop-oldest overflow
pub struct HandoffQueue {
    items: Mutex<VecDeque<Handoff>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl HandoffQueue {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, discarding the oldest one if the queue is full.
    ///
    /// Safe to call from any thread; never blocks on the consumer.
    pub fn push(&self, item: Handoff) {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };

        if let Some(evicted) = evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                device_id = %evicted.device_id,
                dropped_total = total,
                "Handoff queue full, dropped oldest update"
            );
        }
    }

    /// Take every queued item in arrival order
    pub fn drain(&self) -> Vec<Handoff> {
        let mut items = self.items.lock();
        items.drain(..).collect()
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total items discarded due to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn item(device: &str, n: u64) -> Handoff {
        Handoff {
            device_id: device.to_string(),
            value: json!({ "n": n }),
        }
    }

    #[test]
    fn test_drain_preserves_order() {
        let queue = HandoffQueue::new(8);
        queue.push(item("a", 1));
        queue.push(item("b", 2));
        queue.push(item("a", 3));

        let drained = queue.drain();
        let ns: Vec<u64> = drained.iter().map(|h| h.value["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = HandoffQueue::new(2);
        queue.push(item("a", 1));
        queue.push(item("a", 2));
        queue.push(item("a", 3));

        assert_eq!(queue.dropped(), 1);
        let ns: Vec<u64> = queue
            .drain()
            .iter()
            .map(|h| h.value["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(HandoffQueue::new(10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for n in 0..500 {
                        queue.push(item(&format!("dev{}", t), n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 2000);
        assert_eq!(queue.dropped(), 0);
    }
}
