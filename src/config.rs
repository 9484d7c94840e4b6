//! Typed configuration surface for the resilience and concurrency core.
//!
//! Every component takes its configuration by value rather than reaching
//! into a global singleton, so a process can run more than one independent
//! core (e.g. in tests) without cross-talk.

use std::time::Duration;

/// Timeout hierarchy: `tool < daemon < shim < client`, each a multiple of
/// the workflow timeout it derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub simple_tool: Duration,
    pub workflow_tool: Duration,
    pub expert_analysis: Duration,
    pub daemon: Duration,
    pub shim: Duration,
    pub client: Duration,
}

impl TimeoutConfig {
    pub const DAEMON_RATIO: f64 = 1.5;
    pub const SHIM_RATIO: f64 = 2.0;
    pub const CLIENT_RATIO: f64 = 2.5;

    /// Derive daemon/shim/client timeouts from a workflow timeout using the
    /// default ratios.
    pub fn from_workflow_timeout(
        simple_tool: Duration,
        workflow_tool: Duration,
        expert_analysis: Duration,
    ) -> Result<Self, ConfigError> {
        let scale = |ratio: f64| Duration::from_secs_f64(workflow_tool.as_secs_f64() * ratio);
        let config = Self {
            simple_tool,
            workflow_tool,
            expert_analysis,
            daemon: scale(Self::DAEMON_RATIO),
            shim: scale(Self::SHIM_RATIO),
            client: scale(Self::CLIENT_RATIO),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow_tool >= self.daemon
            || self.daemon >= self.shim
            || self.shim >= self.client
        {
            return Err(ConfigError::TimeoutHierarchy {
                workflow: self.workflow_tool,
                daemon: self.daemon,
                shim: self.shim,
                client: self.client,
            });
        }
        let ratio = |a: Duration, b: Duration| b.as_secs_f64() / a.as_secs_f64();
        if ratio(self.workflow_tool, self.daemon) < Self::DAEMON_RATIO
            || ratio(self.workflow_tool, self.shim) < Self::SHIM_RATIO
            || ratio(self.workflow_tool, self.client) < Self::CLIENT_RATIO
        {
            return Err(ConfigError::TimeoutRatioTooLow);
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::from_workflow_timeout(
            Duration::from_secs(30),
            Duration::from_secs(45),
            Duration::from_secs(60),
        )
        .expect("default timeout configuration is valid")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_queue_size: usize,
    pub message_ttl: Duration,
    pub connection_timeout: Duration,
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_check_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            message_ttl: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(120),
            max_retry_attempts: 5,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_check_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self { enabled: true, ttl: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    pub sample_rate: f64,
    pub min_sample_rate: f64,
    pub max_sample_rate: f64,
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub adaptive_sampling: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.03,
            min_sample_rate: 0.01,
            max_sample_rate: 0.15,
            buffer_size: 2000,
            flush_interval: Duration::from_secs(2),
            adaptive_sampling: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout: Duration,
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationConfig {
    pub max_attempts: u32,
    pub max_total_tokens: u64,
    pub backoff_delays: Vec<Duration>,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_total_tokens: 32_000,
            backoff_delays: vec![
                Duration::from_secs(0),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationQueueConfig {
    pub max_size: usize,
    pub warning_threshold: usize,
}

impl Default for ConversationQueueConfig {
    fn default() -> Self {
        Self { max_size: 1000, warning_threshold: 500 }
    }
}

/// LRU+TTL bounds for the provider context-cache token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for ContextCacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(1800), capacity: 256 }
    }
}

/// Root configuration aggregating every group above. Constructed once at
/// startup and passed by value into the components that need it.
#[derive(Debug, Clone)]
pub struct Config {
    pub timeouts: TimeoutConfig,
    pub transport: TransportConfig,
    pub dedup: DeduplicationConfig,
    pub metrics: MetricsConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub continuation: ContinuationConfig,
    pub conversation_queue: ConversationQueueConfig,
    pub context_cache: ContextCacheConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            transport: TransportConfig::default(),
            dedup: DeduplicationConfig::default(),
            metrics: MetricsConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            continuation: ContinuationConfig::default(),
            conversation_queue: ConversationQueueConfig::default(),
            context_cache: ContextCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "timeout hierarchy violated: workflow={workflow:?} daemon={daemon:?} shim={shim:?} client={client:?}, expected workflow < daemon < shim < client"
    )]
    TimeoutHierarchy { workflow: Duration, daemon: Duration, shim: Duration, client: Duration },
    #[error("timeout ratios below required floors (daemon >= 1.5x, shim >= 2.0x, client >= 2.5x workflow)")]
    TimeoutRatioTooLow,
}
