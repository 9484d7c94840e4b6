//! Shared data types used across the transport and provider layers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// State of one live client connection, owned exclusively by the manager
/// entry that registered it.
#[derive(Debug)]
pub struct ConnectionState {
    pub last_message_time: Instant,
    pub is_connected: bool,
    pub retry_count: u32,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self { last_message_time: Instant::now(), is_connected: true, retry_count: 0 }
    }

    pub fn touch(&mut self) {
        self.last_message_time = Instant::now();
        self.retry_count = 0;
    }

    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
    }

    /// True once the connection has been idle for at least `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_message_time.elapsed() >= timeout
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Context carried through one provider call, including whatever session
/// metadata gets injected into the response.
#[derive(Debug, Clone)]
pub struct ProviderCallContext {
    pub provider: String,
    pub model: String,
    pub request_id: String,
    pub session_id: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

impl ProviderCallContext {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: generate_session_id("session"),
            timeout,
            headers: HashMap::new(),
        }
    }

    /// Insert a header, silently dropping it if either the name or the
    /// value exceeds the byte-length cap (default 4096B per the external
    /// interface contract).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>, max_bytes: usize) {
        let name = name.into();
        let value = value.into();
        if name.len() > max_bytes || value.len() > max_bytes {
            tracing::debug!(header = %name, "dropping oversized provider header");
            return;
        }
        self.headers.insert(name, value);
    }
}

/// Generate an identifier of the form `"<prefix>_<monotonic-ms>_<counter>"`,
/// unique within this process.
pub fn generate_session_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{counter}", start.elapsed().as_millis())
}
