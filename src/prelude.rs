//! Convenient re-exports for the common types in this crate.
pub use crate::{
    backoff::{
        Backoff, BackoffError, BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff,
        MAX_BACKOFF,
    },
    background_tasks::{BackgroundTaskManager, BackgroundTaskStats, MessageSender},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStats, CircuitState},
    circuit_breaker_registry::{CircuitBreakerHandle, CircuitBreakerManager, CircuitBreakerRegistry},
    config::{
        CircuitBreakerSettings, Config, ConfigError, ContextCacheConfig, ContinuationConfig,
        ConversationQueueConfig, DeduplicationConfig, MetricsConfig, TimeoutConfig, TransportConfig,
    },
    continuation::{ContinuationManager, ContinuationOutcome, ContinuationSession, ProviderCallable, StopReason},
    conversation_queue::{ConversationQueue, ConversationQueueMetrics, QueueItem},
    dedup::{DeduplicatorStats, MessageDeduplicator},
    jitter::Jitter,
    message_queue::{MessageQueue, QueuedMessage},
    metrics::{MetricsSnapshot, MetricsWrapper, ProductionMetrics},
    models::{ConnectionState, ProviderCallContext},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    session_executor::{ContextCacheStore, ProviderSessionExecutor, SessionError},
    telemetry::{
        BulkheadEvent, CircuitBreakerEvent, FallbackSink, LogSink, MemorySink, MulticastSink,
        NullSink, PolicyEvent, RequestOutcome, RetryEvent, StreamingSink, TelemetrySink,
        TimeoutEvent,
    },
    timeout::TimeoutLayer,
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    truncation::{FinishReason, TruncationDetector, TruncationVerdict},
    ws_manager::{GracefulShutdownStats, ResilientWebSocketManager, SendOutcome, Transport},
    BulkheadPolicy, ResilienceError,
};
