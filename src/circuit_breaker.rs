//! Circuit breaker implementation with lock-free atomics

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state byte"),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    /// Consecutive half-open successes required before closing.
    pub success_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold: 2,
            recovery_timeout,
            half_open_max_calls: 3,
        }
    }

    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: usize::MAX,
        }
    }
}

/// Snapshot of breaker counters, safe to hand out to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub half_open_calls: usize,
}

pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            success_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }

    pub(crate) fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.current_state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            half_open_calls: self.half_open_calls.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerState").field("stats", &self.stats()).finish()
    }
}

type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig::new(failure_threshold, recovery_timeout))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
            on_state_change: None,
        }
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_half_open_limit(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    /// Register a callback invoked on every state transition, with the
    /// previous and new state.
    pub fn with_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Current state, without performing the OPEN -> HALF_OPEN recovery
    /// check. A caller gating a call on breaker state should use
    /// [`CircuitBreakerPolicy::should_attempt`] instead, or this will never
    /// observe recovery once the breaker opens.
    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    /// Returns true if a call should be attempted right now, performing the
    /// OPEN -> HALF_OPEN recovery-timeout transition if it's due — the same
    /// check `execute`'s first branch makes before running the wrapped
    /// call. For callers that do their own I/O and only report the outcome
    /// via `on_success`/`on_failure` (rather than wrapping the call in
    /// `execute`), this is what lets the breaker recover after
    /// `recovery_timeout` instead of staying OPEN forever. Unlike
    /// `execute`, this does not enforce `half_open_max_calls` — callers that
    /// need that concurrency cap should route through `execute` instead.
    pub fn should_attempt(&self) -> bool {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);
            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("Circuit breaker → half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.success_count.store(0, Ordering::Release);
                                self.notify(CircuitState::Open, CircuitState::HalfOpen);
                                return true;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => return true,
                            Err(_) => unreachable!("Invalid state transition"),
                        }
                    } else {
                        return false;
                    }
                }
                STATE_HALF_OPEN | STATE_CLOSED => return true,
                _ => unreachable!("Invalid circuit breaker state"),
            }
        }
    }

    /// Counters and state as a point-in-time snapshot.
    pub fn stats(&self) -> CircuitBreakerStats {
        self.state.stats()
    }

    /// Force the breaker back to a clean closed state, discarding counters.
    pub fn reset(&self) {
        let previous = self.state.current_state();
        self.state.reset();
        if previous != CircuitState::Closed {
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Manually force a transition, bypassing the usual failure/success
    /// bookkeeping. Intended for operator intervention and tests.
    pub fn change_state(&self, new_state: CircuitState) {
        let previous = self.state.current_state();
        let target = match new_state {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        };
        self.state.state.store(target, Ordering::Release);
        match new_state {
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
                self.state.success_count.store(0, Ordering::Release);
                self.state.opened_at_millis.store(0, Ordering::Release);
            }
            CircuitState::Open => {
                self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                self.state.success_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.state.half_open_calls.store(0, Ordering::Release);
                self.state.success_count.store(0, Ordering::Release);
            }
        }
        if previous != new_state {
            self.notify(previous, new_state);
        }
    }

    pub(crate) fn shared_state(&self) -> Arc<CircuitBreakerState> {
        self.state.clone()
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // Check state and enforce policy
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        // Try transition to half-open
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // We won the race - we're the first half-open caller
                                tracing::info!("Circuit breaker → half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.success_count.store(0, Ordering::Release);
                                self.notify(CircuitState::Open, CircuitState::HalfOpen);
                                break; // Proceed to execute
                            }
                            Err(STATE_HALF_OPEN) => {
                                // Someone else transitioned to half-open
                                // Re-check on next iteration
                                continue;
                            }
                            Err(STATE_CLOSED) => {
                                // Someone else closed it - we're good
                                break;
                            }
                            Err(_) => unreachable!("Invalid state transition"),
                        }
                    } else {
                        // Still in timeout period
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    // Limit concurrent test requests
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "Circuit breaker: half-open test request"
                    );
                    break; // Proceed to execute
                }
                STATE_CLOSED => {
                    break; // Normal operation
                }
                _ => unreachable!("Invalid circuit breaker state"),
            }
        }

        // Execute the operation
        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        // Decrement half-open counter if needed
        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        // Update state based on result
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    /// Report a successful call outside of `execute` (e.g. a caller that
    /// performs its own I/O and merely reports the outcome).
    pub fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                let successes = self.state.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.success_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("Circuit breaker → closed");
                    self.notify(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Report a failed call outside of `execute`.
    pub fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.success_count.store(0, Ordering::Release);
                    self.state
                        .opened_at_millis
                        .store(self.now_millis(), Ordering::Release);
                    tracing::warn!("Circuit breaker: half-open test failed → open");
                    self.notify(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            STATE_CLOSED => {
                let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    self.notify(CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn notify(&self, previous: CircuitState, new_state: CircuitState) {
        if let Some(callback) = &self.on_state_change {
            callback(previous, new_state);
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(10));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter_clone = counter.clone();
            let _ = breaker
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                    }
                })
                .await;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should have executed 3 times");

        counter.store(0, Ordering::SeqCst);
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "Should not execute when circuit is open");
    }

    #[tokio::test]
    async fn test_circuit_transitions_to_half_open_after_timeout() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter_clone = counter.clone();
            let _ = breaker
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                    }
                })
                .await;
        }

        counter.store(0, Ordering::SeqCst);
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;

        counter.store(0, Ordering::SeqCst);
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(100)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 100);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should execute in half-open state");
    }

    #[tokio::test]
    async fn test_should_attempt_stays_false_until_recovery_timeout_elapses() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_secs(10)).with_clock(clock.clone());

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_attempt());

        clock.advance(5_000);
        assert!(!breaker.should_attempt());

        clock.advance(5_000);
        assert!(breaker.should_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_should_attempt_true_when_closed_or_half_open() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(10));
        assert!(breaker.should_attempt());

        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.should_attempt());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.should_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.should_attempt());
    }

    #[tokio::test]
    async fn test_circuit_stays_half_open_after_single_success_when_threshold_is_two() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(1) }).await;

        // One success is not enough with the default success_threshold of 2.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(2) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_interleaved_failure_during_half_open_resets_success_count() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // One success, then a failure: should reopen rather than carry over
        // the partial success count toward the next half-open window.
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(1) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = breaker
            .execute(
                || async { Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string()))) },
            )
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(1) }).await;
        assert_eq!(
            breaker.state(),
            CircuitState::HalfOpen,
            "success count should not have carried over from the earlier window"
        );
    }

    #[tokio::test]
    async fn test_circuit_reopens_if_half_open_test_fails() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("fail again".to_string())))
            })
            .await;

        let result = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;

        assert!(result.is_err());
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_calls() {
        let breaker =
            CircuitBreakerPolicy::new(2, Duration::from_millis(100)).with_half_open_limit(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut handles = vec![];
        for _ in 0..3 {
            let breaker_clone = breaker.clone();
            let counter_clone = counter.clone();
            let handle = tokio::spawn(async move {
                breaker_clone
                    .execute(|| {
                        let counter = counter_clone.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ResilienceError<TestError>>(42)
                        }
                    })
                    .await
            });
            handles.push(handle);
        }

        let results: Vec<_> = futures::future::join_all(handles).await;

        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let circuit_opens = results
            .iter()
            .filter(|r| r.as_ref().unwrap().as_ref().err().map_or(false, |e| e.is_circuit_open()))
            .count();

        assert_eq!(successes, 1, "Only 1 call should succeed in half-open");
        assert_eq!(circuit_opens, 2, "Other 2 calls should be rejected");
    }

    #[tokio::test]
    async fn test_disabled_circuit_breaker_never_opens() {
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter_clone = counter.clone();
            let _ = breaker
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                    }
                })
                .await;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1000, "All calls should execute with disabled breaker");

        counter.store(0, Ordering::SeqCst);
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successes_in_closed_state_reset_failure_count() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
        }

        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;

        for _ in 0..2 {
            let result = breaker
                .execute(|| async {
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                })
                .await;
            assert!(result.is_err());
            if let Err(ResilienceError::Inner(_)) = result {
            } else {
                panic!("Expected Inner error, not circuit open");
            }
        }
    }

    #[tokio::test]
    async fn test_custom_clock_allows_instant_recovery() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreakerPolicy::new(1, Duration::from_millis(100)).with_clock(clock.clone());

        let _ = breaker
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
            })
            .await;

        let open_result =
            breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(open_result.unwrap_err().is_circuit_open());

        clock.advance(150);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let success = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(success.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_success_and_on_failure_reported_outside_execute() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(50));

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Manually probing the half-open window the way a caller that does
        // its own I/O (rather than wrapping it in `execute`) would.
        assert_eq!(
            breaker
                .execute(|| async { Ok::<_, ResilienceError<TestError>>(()) })
                .await
                .is_ok(),
            true
        );
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_change_callback_invoked_on_transitions() {
        let transitions = Arc::new(Mutex::new(Vec::<(CircuitState, CircuitState)>::new()));
        let transitions_clone = transitions.clone();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_millis(50))
            .with_state_change(move |old, new| {
                transitions_clone.lock().unwrap().push((old, new));
            });

        breaker.on_failure();
        assert_eq!(transitions.lock().unwrap().as_slice(), &[(CircuitState::Closed, CircuitState::Open)]);

        breaker.reset();
        assert_eq!(
            transitions.lock().unwrap().as_slice(),
            &[(CircuitState::Closed, CircuitState::Open), (CircuitState::Open, CircuitState::Closed)]
        );
    }

    #[test]
    fn test_change_state_manual_override() {
        let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.change_state(CircuitState::Open);
        assert_eq!(breaker.state(), CircuitState::Open);
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
    }
}
