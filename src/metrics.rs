//! Sampled metrics pipeline: ring buffer (C4), adaptive sampler (C5), and
//! the aggregator that owns both (C6).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::MetricsConfig;

#[derive(Debug, Clone)]
struct CompactMetric {
    timestamp: f64,
    name: String,
    value: f64,
    is_critical: bool,
    client_id: String,
}

fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Fixed-capacity buffer of sampled metrics. Appending past capacity
/// overwrites the oldest entry.
struct RingBuffer {
    capacity: usize,
    buf: Mutex<VecDeque<CompactMetric>>,
    added: AtomicU64,
    dropped: AtomicU64,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            added: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, metric: CompactMetric) {
        let mut buf = self.buf.lock().expect("ring buffer mutex poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(metric);
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    fn len(&self) -> usize {
        self.buf.lock().expect("ring buffer mutex poisoned").len()
    }

    /// Swap out the entire contents, leaving the buffer empty.
    fn drain(&self) -> VecDeque<CompactMetric> {
        let mut buf = self.buf.lock().expect("ring buffer mutex poisoned");
        std::mem::take(&mut *buf)
    }
}

/// Controls what fraction of non-critical metrics get sampled, adjusting
/// itself based on how full the ring buffer is.
struct AdaptiveSampler {
    current_rate_bits: AtomicU64,
    min_rate: f64,
    max_rate: f64,
    last_adjustment_ms: AtomicU64,
    start: Instant,
    enabled: bool,
}

const ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(5);
const HIGH_WATERMARK: f64 = 0.8;
const LOW_WATERMARK: f64 = 0.3;
const SHRINK_FACTOR: f64 = 0.7;
const GROW_FACTOR: f64 = 1.2;

impl AdaptiveSampler {
    fn new(initial_rate: f64, min_rate: f64, max_rate: f64, enabled: bool) -> Self {
        Self {
            current_rate_bits: AtomicU64::new(initial_rate.to_bits()),
            min_rate,
            max_rate,
            last_adjustment_ms: AtomicU64::new(0),
            start: Instant::now(),
            enabled,
        }
    }

    fn current_rate(&self) -> f64 {
        f64::from_bits(self.current_rate_bits.load(Ordering::Relaxed))
    }

    fn should_sample(&self, is_critical: bool) -> bool {
        is_critical || rand::random::<f64>() < self.current_rate()
    }

    /// Re-evaluate the sampling rate against `fill_ratio`, gated to once per
    /// [`ADJUSTMENT_INTERVAL`]. A no-op if another thread just adjusted.
    fn maybe_adjust(&self, fill_ratio: f64) {
        if !self.enabled {
            return;
        }
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_adjustment_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < ADJUSTMENT_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_adjustment_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let rate = self.current_rate();
        let adjusted = if fill_ratio > HIGH_WATERMARK {
            (rate * SHRINK_FACTOR).max(self.min_rate)
        } else if fill_ratio < LOW_WATERMARK {
            (rate * GROW_FACTOR).min(self.max_rate)
        } else {
            rate
        };
        self.current_rate_bits.store(adjusted.to_bits(), Ordering::Relaxed);
    }
}

/// Meta-metrics: always produced, never themselves sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub buffer_size: usize,
    pub capacity: usize,
    pub fill_ratio: f64,
    pub metrics_added: u64,
    pub metrics_dropped: u64,
    pub drop_rate: f64,
    pub flush_count: u64,
    pub avg_flush_duration_ms: f64,
    pub current_sample_rate: f64,
}

/// Sampling metrics aggregator: records on the hot path, flushes on a
/// background interval, and corrects sampled sums for the rate in effect
/// at flush time.
pub struct ProductionMetrics {
    sampler: AdaptiveSampler,
    buffer: RingBuffer,
    aggregated: Mutex<HashMap<String, f64>>,
    flush_interval: Duration,
    flush_count: AtomicU64,
    total_flush_duration_ms: AtomicU64,
}

impl ProductionMetrics {
    pub fn new(config: &MetricsConfig) -> Arc<Self> {
        Arc::new(Self {
            sampler: AdaptiveSampler::new(
                config.sample_rate,
                config.min_sample_rate,
                config.max_sample_rate,
                config.adaptive_sampling,
            ),
            buffer: RingBuffer::new(config.buffer_size),
            aggregated: Mutex::new(HashMap::new()),
            flush_interval: config.flush_interval,
            flush_count: AtomicU64::new(0),
            total_flush_duration_ms: AtomicU64::new(0),
        })
    }

    /// Hot path: sample, append, and (cheaply) check whether the sampler
    /// needs to adjust. Target cost is sub-microsecond.
    pub fn record(&self, name: impl Into<String>, value: f64, is_critical: bool, client_id: impl Into<String>) {
        if !self.sampler.should_sample(is_critical) {
            return;
        }
        self.buffer.push(CompactMetric {
            timestamp: unix_timestamp(),
            name: name.into(),
            value,
            is_critical,
            client_id: client_id.into(),
        });
        let fill_ratio = self.buffer.len() as f64 / self.buffer.capacity as f64;
        self.sampler.maybe_adjust(fill_ratio);
    }

    /// Drain the buffer into the aggregated counters, applying the unbiased
    /// estimator correction for non-critical (sampled) metrics.
    pub fn flush(&self) {
        let started = Instant::now();
        let rate = self.sampler.current_rate().max(f64::MIN_POSITIVE);
        let drained = self.buffer.drain();

        let mut aggregated = self.aggregated.lock().expect("aggregated metrics mutex poisoned");
        for metric in drained {
            let correction = if metric.is_critical { 1.0 } else { 1.0 / rate };
            *aggregated.entry(metric.name).or_insert(0.0) += metric.value * correction;
        }
        drop(aggregated);

        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.total_flush_duration_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Spawn the background flush loop. The returned handle should be
    /// cancelled during shutdown.
    pub fn spawn_flush_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.flush_interval).await;
                this.flush();
            }
        })
    }

    pub fn aggregated_value(&self, name: &str) -> f64 {
        self.aggregated.lock().expect("aggregated metrics mutex poisoned").get(name).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let buffer_size = self.buffer.len();
        let capacity = self.buffer.capacity;
        let added = self.buffer.added.load(Ordering::Relaxed);
        let dropped = self.buffer.dropped.load(Ordering::Relaxed);
        let flush_count = self.flush_count.load(Ordering::Relaxed);
        let total_flush_ms = self.total_flush_duration_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            buffer_size,
            capacity,
            fill_ratio: buffer_size as f64 / capacity as f64,
            metrics_added: added,
            metrics_dropped: dropped,
            drop_rate: if added == 0 { 0.0 } else { dropped as f64 / added as f64 },
            flush_count,
            avg_flush_duration_ms: if flush_count == 0 { 0.0 } else { total_flush_ms as f64 / flush_count as f64 },
            current_sample_rate: self.sampler.current_rate(),
        }
    }
}

/// Backward-compatible facade exposing the legacy high-level counters over
/// a [`ProductionMetrics`] instance.
#[derive(Clone)]
pub struct MetricsWrapper {
    metrics: Arc<ProductionMetrics>,
}

impl MetricsWrapper {
    pub fn new(metrics: Arc<ProductionMetrics>) -> Self {
        Self { metrics }
    }

    pub fn connection_opened(&self, client_id: &str) {
        self.metrics.record("connections.opened", 1.0, false, client_id);
    }

    pub fn connection_closed(&self, client_id: &str) {
        self.metrics.record("connections.closed", 1.0, false, client_id);
    }

    pub fn message_sent(&self, client_id: &str) {
        self.metrics.record("messages.sent", 1.0, false, client_id);
    }

    pub fn message_queued(&self, client_id: &str) {
        self.metrics.record("messages.queued", 1.0, false, client_id);
    }

    pub fn message_deduplicated(&self, client_id: &str) {
        self.metrics.record("messages.deduplicated", 1.0, false, client_id);
    }

    pub fn message_failed(&self, client_id: &str) {
        self.metrics.record("messages.failed", 1.0, true, client_id);
    }

    pub fn retry_attempt(&self, client_id: &str) {
        self.metrics.record("retry.attempts", 1.0, false, client_id);
    }

    pub fn retry_success(&self, client_id: &str) {
        self.metrics.record("retry.successes", 1.0, false, client_id);
    }

    pub fn retry_failure(&self, client_id: &str) {
        self.metrics.record("retry.failures", 1.0, true, client_id);
    }

    pub fn circuit_breaker_opened(&self, client_id: &str) {
        self.metrics.record("circuit_breaker.opens", 1.0, true, client_id);
    }

    pub fn circuit_breaker_closed(&self, client_id: &str) {
        self.metrics.record("circuit_breaker.closes", 1.0, true, client_id);
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.metrics.aggregated_value(name)
    }

    pub fn flush(&self) {
        self.metrics.flush();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
