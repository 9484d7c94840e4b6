//! Resilient delivery over a pluggable transport: dedup, circuit breaker,
//! retry queue, and graceful shutdown wired together (C8).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::background_tasks::{BackgroundTaskManager, MessageSender};
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::config::TransportConfig;
use crate::dedup::MessageDeduplicator;
use crate::message_queue::{MessageQueue, QueuedMessage};
use crate::metrics::MetricsWrapper;
use crate::models::ConnectionState;

/// Abstraction over the underlying socket. The manager never speaks the
/// wire protocol directly — a concrete implementation supplies the actual
/// I/O (WebSocket, in-memory channel, whatever the embedding service uses).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, client_id: &str, payload: &str) -> Result<(), String>;
    async fn close(&self, client_id: &str, code: u16, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Deduplicated,
    Queued,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracefulShutdownStats {
    pub pending_messages_flushed: usize,
    pub pending_messages_dropped: usize,
    pub connections_closed: usize,
    pub background_tasks_stopped: bool,
    pub metrics_cleaned: bool,
    pub duration: Duration,
}

struct TransportSender(Arc<dyn Transport>);

#[async_trait]
impl MessageSender for TransportSender {
    async fn send_to(&self, client_id: &str, payload: &serde_json::Value) -> bool {
        self.0.send(client_id, &payload.to_string()).await.is_ok()
    }
}

pub struct ResilientWebSocketManager {
    transport: Arc<dyn Transport>,
    dedup: Arc<MessageDeduplicator>,
    breaker: Arc<CircuitBreakerPolicy>,
    queue: Arc<MessageQueue>,
    connections: Arc<Mutex<HashMap<String, ConnectionState>>>,
    metrics: MetricsWrapper,
    background: Arc<BackgroundTaskManager>,
}

impl ResilientWebSocketManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        dedup: Arc<MessageDeduplicator>,
        breaker: Arc<CircuitBreakerPolicy>,
        config: TransportConfig,
        metrics: MetricsWrapper,
    ) -> Arc<Self> {
        let queue = Arc::new(MessageQueue::new(config.max_queue_size, config.message_ttl));
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let sender: Arc<dyn MessageSender> = Arc::new(TransportSender(Arc::clone(&transport)));
        let background = Arc::new(BackgroundTaskManager::new(
            Arc::clone(&queue),
            Arc::clone(&connections),
            sender,
            config,
        ));
        Arc::new(Self { transport, dedup, breaker, queue, connections, metrics, background })
    }

    pub fn start_background_tasks(self: &Arc<Self>) {
        self.background.spawn();
    }

    pub fn register_connection(&self, client_id: impl Into<String>) {
        let client_id = client_id.into();
        self.metrics.connection_opened(&client_id);
        self.connections.lock().expect("connections mutex poisoned").insert(client_id, ConnectionState::new());
    }

    pub fn unregister_connection(&self, client_id: &str) {
        self.connections.lock().expect("connections mutex poisoned").remove(client_id);
        self.metrics.connection_closed(client_id);
    }

    /// Dedup -> breaker -> transport write -> retry queue, per the
    /// delivery contract: sending the same message twice within the
    /// dedup TTL is a no-op.
    pub async fn send(&self, client_id: &str, message: serde_json::Value, critical: bool) -> SendOutcome {
        self.dedup.set_current_client_id(client_id);
        if let Some(id) = self.dedup.message_id(&message) {
            if self.dedup.is_duplicate(&id) {
                self.metrics.message_deduplicated(client_id);
                return SendOutcome::Deduplicated;
            }
        }

        if !self.breaker.should_attempt() {
            if critical {
                self.queue.enqueue(client_id, QueuedMessage::new(message));
                return SendOutcome::Queued;
            }
            return SendOutcome::Rejected;
        }

        match self.transport.send(client_id, &message.to_string()).await {
            Ok(()) => {
                if let Some(state) = self.connections.lock().expect("connections mutex poisoned").get_mut(client_id) {
                    state.touch();
                }
                self.metrics.message_sent(client_id);
                self.breaker.on_success();
                SendOutcome::Sent
            }
            Err(err) => {
                tracing::warn!(client_id, error = %err, "send failed");
                self.metrics.message_failed(client_id);
                self.breaker.on_failure();
                if critical {
                    self.queue.enqueue(client_id, QueuedMessage::new(message));
                }
                if let Some(state) = self.connections.lock().expect("connections mutex poisoned").get_mut(client_id) {
                    state.mark_disconnected();
                }
                SendOutcome::Failed
            }
        }
    }

    /// Flush pending queues, optionally close live connections, stop the
    /// background loops, and reset to an empty state.
    pub async fn shutdown(
        &self,
        timeout: Duration,
        flush_pending: bool,
        close_connections: bool,
    ) -> GracefulShutdownStats {
        let started = Instant::now();
        let mut flushed = 0usize;
        let mut dropped = 0usize;

        if flush_pending {
            let flush_deadline = timeout.mul_f64(0.7).min(Duration::from_secs(20));
            let flush_started = Instant::now();
            for client_id in self.queue.client_ids() {
                while let Some(message) = self.queue.dequeue(&client_id) {
                    if flush_started.elapsed() >= flush_deadline {
                        dropped += 1;
                        continue;
                    }
                    match self.transport.send(&client_id, &message.payload.to_string()).await {
                        Ok(()) => flushed += 1,
                        Err(_) => dropped += 1,
                    }
                }
            }
        }

        let mut connections_closed = 0usize;
        if close_connections {
            let client_ids: Vec<String> = {
                let connections = self.connections.lock().expect("connections mutex poisoned");
                connections.iter().filter(|(_, s)| s.is_connected).map(|(id, _)| id.clone()).collect()
            };
            for client_id in client_ids {
                self.transport.close(&client_id, 1001, "Server shutting down").await;
                connections_closed += 1;
            }
        }

        self.background.shutdown().await;

        {
            let mut connections = self.connections.lock().expect("connections mutex poisoned");
            connections.clear();
        }
        self.dedup.clear();

        GracefulShutdownStats {
            pending_messages_flushed: flushed,
            pending_messages_dropped: dropped,
            connections_closed,
            background_tasks_stopped: true,
            metrics_cleaned: true,
            duration: started.elapsed(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections mutex poisoned").len()
    }

    pub fn background_stats(&self) -> crate::background_tasks::BackgroundTaskStats {
        self.background.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MockTransport {
        fail: std::sync::atomic::AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self { fail: std::sync::atomic::AtomicBool::new(false), sent: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, client_id: &str, payload: &str) -> Result<(), String> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err("connection reset".to_string());
            }
            self.sent.lock().unwrap().push((client_id.to_string(), payload.to_string()));
            Ok(())
        }

        async fn close(&self, _client_id: &str, _code: u16, _reason: &str) {}
    }

    fn manager(transport: Arc<MockTransport>) -> Arc<ResilientWebSocketManager> {
        manager_with_breaker(transport, CircuitBreakerPolicy::new(2, Duration::from_secs(30)))
    }

    fn manager_with_breaker(
        transport: Arc<MockTransport>,
        breaker: CircuitBreakerPolicy,
    ) -> Arc<ResilientWebSocketManager> {
        let dedup = Arc::new(MessageDeduplicator::new(Duration::from_secs(300), true));
        let metrics = MetricsWrapper::new(crate::metrics::ProductionMetrics::new(&crate::config::MetricsConfig::default()));
        ResilientWebSocketManager::new(transport, dedup, Arc::new(breaker), TransportConfig::default(), metrics)
    }

    #[tokio::test]
    async fn successful_send_reports_sent() {
        let transport = Arc::new(MockTransport::new());
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");

        let outcome = mgr.send("c1", json!({"id": "m1"}), false).await;
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_send_is_a_noop() {
        let transport = Arc::new(MockTransport::new());
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");

        mgr.send("c1", json!({"id": "m1"}), false).await;
        let outcome = mgr.send("c1", json!({"id": "m1"}), false).await;

        assert_eq!(outcome, SendOutcome::Deduplicated);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_critical_send_is_queued() {
        let transport = Arc::new(MockTransport::new());
        transport.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");

        let outcome = mgr.send("c1", json!({"id": "m1"}), true).await;
        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(mgr.queue.size_for("c1"), 1);
    }

    #[tokio::test]
    async fn breaker_open_rejects_non_critical_without_touching_transport() {
        let transport = Arc::new(MockTransport::new());
        transport.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");

        mgr.send("c1", json!({"id": "m1"}), false).await;
        mgr.send("c1", json!({"id": "m2"}), false).await; // breaker opens (threshold 2)

        let before = transport.sent.lock().unwrap().len();
        let outcome = mgr.send("c1", json!({"id": "m3"}), false).await;
        assert_eq!(outcome, SendOutcome::Rejected);
        assert_eq!(transport.sent.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn breaker_open_queues_critical_messages() {
        let transport = Arc::new(MockTransport::new());
        transport.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");

        mgr.send("c1", json!({"id": "m1"}), false).await;
        mgr.send("c1", json!({"id": "m2"}), false).await;

        let outcome = mgr.send("c1", json!({"id": "m3"}), true).await;
        assert_eq!(outcome, SendOutcome::Queued);
    }

    #[tokio::test]
    async fn send_recovers_once_breaker_passes_recovery_timeout() {
        let transport = Arc::new(MockTransport::new());
        transport.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(20));
        let mgr = manager_with_breaker(Arc::clone(&transport), breaker);
        mgr.register_connection("c1");

        mgr.send("c1", json!({"id": "m1"}), false).await;
        mgr.send("c1", json!({"id": "m2"}), false).await; // breaker opens (threshold 2)

        let rejected = mgr.send("c1", json!({"id": "m3"}), false).await;
        assert_eq!(rejected, SendOutcome::Rejected);

        tokio::time::sleep(Duration::from_millis(30)).await;
        transport.fail.store(false, std::sync::atomic::Ordering::Relaxed);

        let outcome = mgr.send("c1", json!({"id": "m4"}), false).await;
        assert_eq!(outcome, SendOutcome::Sent);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_queue() {
        let transport = Arc::new(MockTransport::new());
        let mgr = manager(Arc::clone(&transport));
        mgr.register_connection("c1");
        mgr.queue.enqueue("c1", QueuedMessage::new(json!({"id": "queued"})));

        let stats = mgr.shutdown(Duration::from_secs(5), true, true).await;
        assert_eq!(stats.pending_messages_flushed, 1);
        assert_eq!(stats.pending_messages_dropped, 0);
        assert!(stats.metrics_cleaned);
    }
}
