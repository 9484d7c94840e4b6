#![forbid(unsafe_code)]

//! # gateway-resilience
//!
//! Resilience and concurrency core for a multi-provider AI gateway: a
//! WebSocket transport manager with per-client queueing, retry, circuit
//! breaking and deduplication; a sampled production metrics pipeline; a
//! provider session executor with transparent truncation continuation; and
//! the shared retry/backoff/timeout/bulkhead toolkit all of the above are
//! built from.
//!
//! ## Features
//!
//! - **Retry policies** with backoff strategies (constant, linear, exponential)
//! - **Circuit breakers** with half-open recovery and a name-indexed registry
//! - **Bulkheads** for concurrency limiting and resource isolation
//! - **Timeout policies** integrated with tokio
//! - **A resilient WebSocket manager**: dedup → breaker → send → queue → retry
//! - **A sampled metrics pipeline** with adaptive sampling under load
//! - **Provider session execution** with truncation detection and continuation
//! - **A bounded conversation-persistence queue** with drop-on-full back-pressure
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gateway_resilience::{
//!     Backoff, BulkheadPolicy, CircuitBreakerPolicy, Jitter, ResilienceError, ResilienceStack,
//!     ResilienceStackBuilder, RetryPolicy, TimeoutPolicy,
//! };
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build()
//!         .expect("valid retry policy");
//!     let timeout = TimeoutPolicy::new(Duration::from_secs(2)).expect("valid timeout");
//!     let bulkhead = BulkheadPolicy::new(32).expect("valid bulkhead");
//!     let circuit_breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
//!
//!     // Compose via the stack builder (Retry → CircuitBreaker → Bulkhead → Timeout).
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStackBuilder::new()
//!         .retry(retry)
//!         .circuit_breaker(5, Duration::from_secs(30))
//!         .bulkhead(32)
//!         .timeout(Duration::from_secs(2)).expect("valid timeout config")
//!         .build();
//!
//!     stack.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod background_tasks;
mod bulkhead;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod continuation;
mod conversation_queue;
mod dedup;
mod error;
mod jitter;
mod message_queue;
mod metrics;
mod models;
mod retry;
mod session_executor;
mod sleeper;
mod stack;
mod telemetry;
mod timeout;
mod truncation;
mod ws_manager;

// Re-exports
pub use backoff::{
    Backoff, BackoffError, BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff,
    MAX_BACKOFF,
};
pub use background_tasks::{BackgroundTaskManager, BackgroundTaskStats, MessageSender};
pub use bulkhead::{BulkheadError, BulkheadPolicy};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStats, CircuitState,
};
pub use circuit_breaker_registry::{CircuitBreakerHandle, CircuitBreakerManager, CircuitBreakerRegistry};
pub use clock::{Clock, MonotonicClock};
pub use config::{
    CircuitBreakerSettings, Config, ConfigError, ContextCacheConfig, ContinuationConfig,
    ConversationQueueConfig, DeduplicationConfig, MetricsConfig, TimeoutConfig, TransportConfig,
};
pub use continuation::{ContinuationManager, ContinuationOutcome, ContinuationSession, ProviderCallable, StopReason};
pub use conversation_queue::{ConversationQueue, ConversationQueueMetrics, QueueItem};
pub use dedup::{DeduplicatorStats, MessageDeduplicator};
pub use error::ResilienceError;
pub use jitter::Jitter;
pub use message_queue::{MessageQueue, QueuedMessage};
pub use metrics::{MetricsSnapshot, MetricsWrapper, ProductionMetrics};
pub use models::{ConnectionState, ProviderCallContext};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use session_executor::{ContextCacheStore, ProviderSessionExecutor, SessionError};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder, StackError};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use truncation::{FinishReason, TruncationDetector, TruncationVerdict};
pub use ws_manager::{GracefulShutdownStats, ResilientWebSocketManager, SendOutcome, Transport};

pub mod prelude;
