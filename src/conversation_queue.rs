//! Bounded single-consumer queue with drop-on-full back-pressure (C11).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ConversationQueueConfig;

/// An item waiting for the consumer, stamped with when it was accepted.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub value: T,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    total_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationQueueMetrics {
    pub total_processed: u64,
    pub total_errors: u64,
    pub total_dropped: u64,
}

const CONSUMER_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded FIFO with exactly one background consumer task. `put` never
/// blocks: a full queue drops the new item and counts it, giving upstream
/// callers natural back-pressure without unbounded thread growth.
pub struct ConversationQueue<T: Send + 'static> {
    sender: Mutex<Option<mpsc::Sender<QueueItem<T>>>>,
    max_size: usize,
    warning_threshold: usize,
    counters: Arc<Counters>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ConversationQueue<T> {
    pub fn new(config: ConversationQueueConfig) -> Self {
        Self {
            sender: Mutex::new(None),
            max_size: config.max_size,
            warning_threshold: config.warning_threshold,
            counters: Arc::new(Counters::default()),
            consumer_handle: Mutex::new(None),
        }
    }

    /// Start the single consumer task. Replaces any previously running
    /// consumer.
    pub fn start<F, Fut>(&self, consumer: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let (tx, mut rx) = mpsc::channel(self.max_size);
        *self.sender.lock().expect("sender mutex poisoned") = Some(tx);

        let counters = Arc::clone(&self.counters);
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(CONSUMER_POLL_TIMEOUT, rx.recv()).await {
                    Ok(Some(item)) => match consumer(item.value).await {
                        Ok(()) => {
                            counters.total_processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            counters.total_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(error = %err, "conversation queue consumer failed");
                        }
                    },
                    Ok(None) => return, // sender dropped: stop() was called.
                    Err(_) => continue, // poll timeout, loop to re-check for a close.
                }
            }
        });
        *self.consumer_handle.lock().expect("consumer handle mutex poisoned") = Some(handle);
    }

    /// Non-blocking enqueue. Returns false (and counts a drop) if the queue
    /// is full or no consumer has been started.
    pub fn put(&self, value: T) -> bool {
        let sender = self.sender.lock().expect("sender mutex poisoned").clone();
        let Some(sender) = sender else {
            self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(QueueItem { value, enqueued_at: Instant::now() }) {
            Ok(()) => {
                if self.size() >= self.warning_threshold {
                    tracing::warn!(size = self.size(), threshold = self.warning_threshold, "conversation queue nearing capacity");
                }
                true
            }
            Err(_) => {
                self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("conversation queue full, dropping item");
                false
            }
        }
    }

    /// Alias for callers outside an async context; `put` is already
    /// non-blocking.
    pub fn put_sync(&self, value: T) -> bool {
        self.put(value)
    }

    pub fn size(&self) -> usize {
        let sender = self.sender.lock().expect("sender mutex poisoned");
        match sender.as_ref() {
            Some(sender) => self.max_size - sender.capacity(),
            None => 0,
        }
    }

    pub fn metrics(&self) -> ConversationQueueMetrics {
        ConversationQueueMetrics {
            total_processed: self.counters.total_processed.load(Ordering::Relaxed),
            total_errors: self.counters.total_errors.load(Ordering::Relaxed),
            total_dropped: self.counters.total_dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for the consumer to drain and exit.
    pub async fn stop(&self) -> ConversationQueueMetrics {
        self.sender.lock().expect("sender mutex poisoned").take();
        let handle = self.consumer_handle.lock().expect("consumer handle mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let metrics = self.metrics();
        tracing::info!(
            total_processed = metrics.total_processed,
            total_errors = metrics.total_errors,
            total_dropped = metrics.total_dropped,
            "conversation queue stopped"
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(max_size: usize) -> ConversationQueueConfig {
        ConversationQueueConfig { max_size, warning_threshold: max_size }
    }

    #[tokio::test]
    async fn processed_items_are_counted() {
        let queue = ConversationQueue::new(config(10));
        let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        queue.start(move |item: i32| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        });

        assert!(queue.put(1));
        assert!(queue.put(2));

        // give the consumer a chance to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = queue.stop().await;

        assert_eq!(metrics.total_processed, 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn put_before_start_is_dropped() {
        let queue: ConversationQueue<i32> = ConversationQueue::new(config(10));
        assert!(!queue.put(1));
        assert_eq!(queue.metrics().total_dropped, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_new_items() {
        let queue = ConversationQueue::new(config(1));
        // consumer that never returns, so the one slot stays occupied.
        let blocker = Arc::new(tokio::sync::Notify::new());
        let blocker_clone = Arc::clone(&blocker);
        queue.start(move |_item: i32| {
            let blocker = Arc::clone(&blocker_clone);
            async move {
                blocker.notified().await;
                Ok(())
            }
        });

        assert!(queue.put(1));
        tokio::time::sleep(Duration::from_millis(20)).await; // let the consumer pick it up
        assert!(queue.put(2)); // fills the now-free channel slot
        assert!(!queue.put(3), "third item must be dropped, queue is full");

        blocker.notify_one();
        let metrics = queue.stop().await;
        assert_eq!(metrics.total_dropped, 1);
    }

    #[tokio::test]
    async fn consumer_errors_are_counted_but_do_not_stop_the_loop() {
        let queue = ConversationQueue::new(config(10));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        queue.start(move |_item: i32| {
            let count = Arc::clone(&count_clone);
            async move {
                count.fetch_add(1, Ordering::Relaxed);
                Err("boom".to_string())
            }
        });

        queue.put(1);
        queue.put(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = queue.stop().await;

        assert_eq!(metrics.total_errors, 2);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
