//! Retry-drain and connection-cleanup background loops (C7).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::message_queue::{MessageQueue, QueuedMessage};
use crate::models::ConnectionState;

/// Delivers a message directly to a connection, bypassing dedup and the
/// circuit breaker — the retry loop only re-sends what already made it
/// past those checks once.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_to(&self, client_id: &str, payload: &serde_json::Value) -> bool;
}

#[derive(Debug, Default)]
struct Counters {
    retries_attempted: AtomicU64,
    retries_succeeded: AtomicU64,
    retries_discarded: AtomicU64,
    connections_timed_out: AtomicU64,
    cleanup_runs: AtomicU64,
    expired_messages_purged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundTaskStats {
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
    pub retries_discarded: u64,
    pub connections_timed_out: u64,
    pub cleanup_runs: u64,
    pub expired_messages_purged: u64,
}

/// Drives the periodic retry-drain and connection-cleanup loops described
/// in the transport's resilience design. Both loops survive transient
/// errors: they log and back off rather than exiting.
pub struct BackgroundTaskManager {
    queue: Arc<MessageQueue>,
    connections: Arc<Mutex<HashMap<String, ConnectionState>>>,
    sender: Arc<dyn MessageSender>,
    config: TransportConfig,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
    on_timeout: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    retry_handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

const RETRY_LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(10);
const CLEANUP_LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(60);

impl BackgroundTaskManager {
    pub fn new(
        queue: Arc<MessageQueue>,
        connections: Arc<Mutex<HashMap<String, ConnectionState>>>,
        sender: Arc<dyn MessageSender>,
        config: TransportConfig,
    ) -> Self {
        Self {
            queue,
            connections,
            sender,
            config,
            counters: Arc::new(Counters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            on_timeout: None,
            retry_handle: Mutex::new(None),
            cleanup_handle: Mutex::new(None),
        }
    }

    pub fn with_on_timeout(mut self, callback: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_timeout = Some(callback);
        self
    }

    /// Start both background loops. Idempotent: calling twice replaces the
    /// previously running tasks.
    pub fn spawn(self: &Arc<Self>) {
        let retry = Arc::clone(self);
        let retry_handle = tokio::spawn(async move { retry.run_retry_loop().await });
        *self.retry_handle.lock().expect("retry handle mutex poisoned") = Some(retry_handle);

        let cleanup = Arc::clone(self);
        let cleanup_handle = tokio::spawn(async move { cleanup.run_cleanup_loop().await });
        *self.cleanup_handle.lock().expect("cleanup handle mutex poisoned") = Some(cleanup_handle);
    }

    /// Signal both loops to stop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let retry = self.retry_handle.lock().expect("retry handle mutex poisoned").take();
        let cleanup = self.cleanup_handle.lock().expect("cleanup handle mutex poisoned").take();
        if let Some(handle) = retry {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = cleanup {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> BackgroundTaskStats {
        BackgroundTaskStats {
            retries_attempted: self.counters.retries_attempted.load(Ordering::Relaxed),
            retries_succeeded: self.counters.retries_succeeded.load(Ordering::Relaxed),
            retries_discarded: self.counters.retries_discarded.load(Ordering::Relaxed),
            connections_timed_out: self.counters.connections_timed_out.load(Ordering::Relaxed),
            cleanup_runs: self.counters.cleanup_runs.load(Ordering::Relaxed),
            expired_messages_purged: self.counters.expired_messages_purged.load(Ordering::Relaxed),
        }
    }

    async fn run_retry_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(self.config.retry_check_interval).await;
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Err(err) = self.drain_all_clients().await {
                tracing::error!(error = %err, "retry loop iteration failed, backing off");
                tokio::time::sleep(RETRY_LOOP_ERROR_BACKOFF).await;
            }
        }
    }

    async fn drain_all_clients(&self) -> Result<(), String> {
        for client_id in self.queue.client_ids() {
            self.drain_client(&client_id).await;
        }
        Ok(())
    }

    async fn drain_client(&self, client_id: &str) {
        loop {
            let registered_and_connected = {
                let connections = self.connections.lock().expect("connections mutex poisoned");
                match connections.get(client_id) {
                    None => None,
                    Some(state) => Some(state.is_connected),
                }
            };
            let Some(is_connected) = registered_and_connected else {
                // client no longer registered: discard its entire queue.
                self.queue.clear_client(client_id);
                return;
            };

            let Some(message) = self.queue.dequeue(client_id) else { return };

            if !is_connected {
                self.queue.requeue_front(client_id, message);
                return;
            }

            self.counters.retries_attempted.fetch_add(1, Ordering::Relaxed);
            if self.sender.send_to(client_id, &message.payload).await {
                self.counters.retries_succeeded.fetch_add(1, Ordering::Relaxed);
                if let Some(state) = self.connections.lock().expect("connections mutex poisoned").get_mut(client_id) {
                    state.touch();
                }
                continue;
            }

            let retry_count = message.retry_count + 1;
            if retry_count < self.config.max_retry_attempts {
                let delay = backoff_with_jitter(
                    self.config.base_retry_delay,
                    self.config.max_retry_delay,
                    retry_count,
                );
                // Deferred, not blocked: the message sits at the front of
                // its queue until `not_before` elapses, and the next
                // `retry_check_interval` tick of the scheduler picks it
                // back up. One client's backoff never stalls another's.
                self.queue.requeue_front(
                    client_id,
                    QueuedMessage { retry_count, not_before: std::time::Instant::now() + delay, ..message },
                );
            } else {
                self.counters.retries_discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(client_id, "dropping message after exhausting retry attempts");
            }
            return;
        }
    }

    async fn run_cleanup_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(self.config.cleanup_interval).await;
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Err(err) = self.run_cleanup_once() {
                tracing::error!(error = %err, "cleanup loop iteration failed, backing off");
                tokio::time::sleep(CLEANUP_LOOP_ERROR_BACKOFF).await;
            }
        }
    }

    fn run_cleanup_once(&self) -> Result<(), String> {
        let purged = self.queue.cleanup_expired();
        self.counters.expired_messages_purged.fetch_add(purged as u64, Ordering::Relaxed);

        let timeout = self.config.connection_timeout;
        let mut timed_out = Vec::new();
        {
            let mut connections = self.connections.lock().expect("connections mutex poisoned");
            for (client_id, state) in connections.iter_mut() {
                if state.is_connected && state.is_timed_out(timeout) {
                    state.mark_disconnected();
                    timed_out.push(client_id.clone());
                }
            }
        }
        for client_id in &timed_out {
            self.counters.connections_timed_out.fetch_add(1, Ordering::Relaxed);
            if let Some(callback) = &self.on_timeout {
                callback(client_id);
            }
        }
        self.counters.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// `delay = min(base * 2^retry_count, max)`, plus uniform jitter in
/// `[0, 0.1 * delay]`.
fn backoff_with_jitter(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let scaled = base.as_secs_f64() * 2f64.powi(retry_count as i32);
    let capped = scaled.min(max.as_secs_f64());
    let jitter = rand::random::<f64>() * 0.1 * capped;
    Duration::from_secs_f64(capped + jitter)
}
