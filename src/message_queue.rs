//! Per-client bounded FIFO message queue with TTL eviction (C2).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A payload waiting to be delivered or retried.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: serde_json::Value,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// Earliest time this message may be dequeued again. Set to a point in
    /// the future when a retry is backed off, so the backoff delay is
    /// enforced by the next scheduler tick rather than by blocking the
    /// drain loop.
    pub not_before: Instant,
}

impl QueuedMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Instant::now();
        Self { payload, enqueued_at: now, retry_count: 0, not_before: now }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.enqueued_at.elapsed() > ttl
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.not_before
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    overflows: u64,
}

/// Bounded, per-client FIFO queue of pending outbound messages.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl MessageQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity, ttl }
    }

    /// Enqueue a message for `client_id`. If the client's queue is already
    /// at capacity, the oldest entry is dropped to make room and
    /// `overflows` is incremented.
    pub fn enqueue(&self, client_id: &str, message: QueuedMessage) {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        let queue = inner.queues.entry(client_id.to_string()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            inner.overflows += 1;
            tracing::warn!(client_id, capacity = self.capacity, "message queue full, dropping oldest");
        }
        inner.queues.entry(client_id.to_string()).or_default().push_back(message);
    }

    /// Pop the next non-expired, due message for `client_id`, discarding any
    /// expired entries encountered along the way. A message whose backoff
    /// hasn't elapsed yet (`not_before` in the future) is left at the front
    /// and `None` is returned rather than blocking for it to become due.
    pub fn dequeue(&self, client_id: &str) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        let ttl = self.ttl;
        let queue = inner.queues.get_mut(client_id)?;
        while let Some(front) = queue.front() {
            if front.is_expired(ttl) {
                queue.pop_front();
                continue;
            }
            if !front.is_due() {
                return None;
            }
            return queue.pop_front();
        }
        None
    }

    /// Re-enqueue at the tail, preserving FIFO order for the rest of the
    /// client's pending messages.
    pub fn requeue_front(&self, client_id: &str, message: QueuedMessage) {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.queues.entry(client_id.to_string()).or_default().push_front(message);
    }

    /// Remove every expired message across all clients; drop now-empty
    /// client queues. Returns the number of messages removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        let ttl = self.ttl;
        let mut removed = 0usize;
        inner.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(ttl));
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    pub fn size_for(&self, client_id: &str) -> usize {
        let inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.queues.get(client_id).map_or(0, VecDeque::len)
    }

    pub fn total_size(&self) -> usize {
        let inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.queues.values().map(VecDeque::len).sum()
    }

    pub fn overflows(&self) -> u64 {
        self.inner.lock().expect("MessageQueue mutex poisoned").overflows
    }

    pub fn client_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.queues.keys().cloned().collect()
    }

    pub fn clear_client(&self, client_id: &str) {
        let mut inner = self.inner.lock().expect("MessageQueue mutex poisoned");
        inner.queues.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: i64) -> QueuedMessage {
        QueuedMessage::new(json!({ "seq": n }))
    }

    #[test]
    fn fifo_order_preserved() {
        let q = MessageQueue::new(10, Duration::from_secs(300));
        q.enqueue("c1", msg(1));
        q.enqueue("c1", msg(2));
        q.enqueue("c1", msg(3));

        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 1 }));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 2 }));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 3 }));
        assert!(q.dequeue("c1").is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = MessageQueue::new(2, Duration::from_secs(300));
        q.enqueue("c1", msg(1));
        q.enqueue("c1", msg(2));
        q.enqueue("c1", msg(3)); // drops seq=1

        assert_eq!(q.size_for("c1"), 2);
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 2 }));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 3 }));
        assert_eq!(q.overflows(), 1);
    }

    #[test]
    fn expired_messages_are_skipped_on_dequeue() {
        let q = MessageQueue::new(10, Duration::from_millis(10));
        q.enqueue("c1", msg(1));
        std::thread::sleep(Duration::from_millis(30));
        q.enqueue("c1", msg(2));

        // seq=1 has aged past the ttl and must be skipped, not returned.
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 2 }));
    }

    #[test]
    fn cleanup_expired_removes_stale_entries_and_empty_queues() {
        let q = MessageQueue::new(10, Duration::from_millis(10));
        q.enqueue("c1", msg(1));
        std::thread::sleep(Duration::from_millis(30));

        let removed = q.cleanup_expired();
        assert_eq!(removed, 1);
        assert_eq!(q.client_ids().len(), 0);
    }

    #[test]
    fn requeue_front_puts_message_back_at_head() {
        let q = MessageQueue::new(10, Duration::from_secs(300));
        q.enqueue("c1", msg(2));
        q.requeue_front("c1", msg(1));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 1 }));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 2 }));
    }

    #[test]
    fn message_not_yet_due_is_left_in_place_instead_of_blocking() {
        let q = MessageQueue::new(10, Duration::from_secs(300));
        let mut pending = msg(1);
        pending.not_before = Instant::now() + Duration::from_millis(50);
        q.enqueue("c1", pending);

        assert!(q.dequeue("c1").is_none(), "not-yet-due message must not be returned");
        assert_eq!(q.size_for("c1"), 1, "not-yet-due message must stay queued");

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 1 }));
    }

    #[test]
    fn boundary_exactly_at_capacity_then_one_more_drops_oldest() {
        let q = MessageQueue::new(3, Duration::from_secs(300));
        q.enqueue("c1", msg(1));
        q.enqueue("c1", msg(2));
        q.enqueue("c1", msg(3));
        assert_eq!(q.size_for("c1"), 3);
        assert_eq!(q.overflows(), 0);

        q.enqueue("c1", msg(4));
        assert_eq!(q.size_for("c1"), 3);
        assert_eq!(q.overflows(), 1);
        assert_eq!(q.dequeue("c1").unwrap().payload, json!({ "seq": 2 }));
    }
}
