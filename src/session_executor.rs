//! Timeout-bounded provider invocation with session bookkeeping (C10).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::config::ContextCacheConfig;
use crate::models::ProviderCallContext;

const MAX_HEADER_BYTES: usize = 4096;

struct CacheInner {
    entries: HashMap<String, (String, Instant)>,
    order: VecDeque<String>,
}

/// In-process LRU+TTL store for provider context-cache tokens, keyed by
/// `(session_id, tool_name, prefix_hash)`. A successful call that sets
/// `Msh-Context-Cache-Token-Saved` on its response feeds the token back in
/// via [`ContextCacheStore::save`]; the next call for the same key picks it
/// up through [`ContextCacheStore::get`] and forwards it as
/// `Msh-Context-Cache-Token`.
pub struct ContextCacheStore {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ContextCacheStore {
    pub fn new(config: ContextCacheConfig) -> Self {
        Self {
            ttl: config.ttl,
            capacity: config.capacity,
            inner: Mutex::new(CacheInner { entries: HashMap::new(), order: VecDeque::new() }),
        }
    }

    fn key(session_id: &str, tool_name: &str, prefix_hash: &str) -> String {
        format!("{session_id}:{tool_name}:{prefix_hash}")
    }

    pub fn get(&self, session_id: &str, tool_name: &str, prefix_hash: &str) -> Option<String> {
        let key = Self::key(session_id, tool_name, prefix_hash);
        let mut inner = self.inner.lock().expect("context cache mutex poisoned");
        match inner.entries.get(&key) {
            Some((token, saved_at)) if saved_at.elapsed() <= self.ttl => Some(token.clone()),
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn save(&self, session_id: &str, tool_name: &str, prefix_hash: &str, token: impl Into<String>) {
        let key = Self::key(session_id, tool_name, prefix_hash);
        let mut inner = self.inner.lock().expect("context cache mutex poisoned");
        inner.entries.insert(key.clone(), (token.into(), Instant::now()));
        inner.order.push_back(key.clone());
        tracing::debug!(key = %key, "context cache token saved");
        self.purge(&mut inner);
    }

    fn purge(&self, inner: &mut CacheInner) {
        let ttl = self.ttl;
        inner.entries.retain(|_, (_, saved_at)| saved_at.elapsed() <= ttl);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else { break };
            inner.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("context cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("provider session {session_id} (request {request_id}) timed out after {timeout:?}")]
    Timeout { session_id: String, request_id: String, timeout: Duration },
    #[error("provider call failed: {0}")]
    Provider(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, SessionError::Provider(_))
    }
}

/// Wraps a provider call with a session id, a request id, a cancellable
/// timeout, and (optionally) session metadata injected into the response.
pub struct ProviderSessionExecutor {
    default_timeout: Duration,
    cache: ContextCacheStore,
}

impl ProviderSessionExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self::with_cache_config(default_timeout, ContextCacheConfig::default())
    }

    pub fn with_cache_config(default_timeout: Duration, cache_config: ContextCacheConfig) -> Self {
        Self { default_timeout, cache: ContextCacheStore::new(cache_config) }
    }

    /// Build the call context (session id, request id, and capped headers)
    /// that a caller can use to assemble outbound HTTP headers.
    pub fn build_context(&self, provider: &str, model: &str, timeout: Duration, idempotency_key: Option<&str>) -> ProviderCallContext {
        let mut ctx = ProviderCallContext::new(provider, model, timeout);
        if let Some(key) = idempotency_key {
            ctx.set_header("Idempotency-Key", key, MAX_HEADER_BYTES);
        }
        ctx
    }

    /// Populate the context-cache headers for a call scoped to
    /// `(session_id, tool_name, prefix_hash)`: `X-Msh-Context-Cache` always,
    /// `X-Msh-Context-Cache-Reset-TTL` when `reset_ttl` is set, and
    /// `Msh-Context-Cache-Token` if a prior call already produced one.
    pub fn apply_cache_headers(
        &self,
        ctx: &mut ProviderCallContext,
        tool_name: &str,
        prefix_hash: &str,
        reset_ttl: Option<Duration>,
    ) {
        ctx.set_header("X-Msh-Context-Cache", ctx.session_id.clone(), MAX_HEADER_BYTES);
        if let Some(reset_ttl) = reset_ttl {
            ctx.set_header("X-Msh-Context-Cache-Reset-TTL", reset_ttl.as_secs().to_string(), MAX_HEADER_BYTES);
        }
        if let Some(token) = self.cache.get(&ctx.session_id, tool_name, prefix_hash) {
            ctx.set_header("Msh-Context-Cache-Token", token, MAX_HEADER_BYTES);
        }
    }

    /// Record a `Msh-Context-Cache-Token-Saved` value observed on a
    /// provider response, for reuse by the next call in the same
    /// `(session_id, tool_name, prefix_hash)` scope.
    pub fn record_cache_token(&self, session_id: &str, tool_name: &str, prefix_hash: &str, token: impl Into<String>) {
        self.cache.save(session_id, tool_name, prefix_hash, token);
    }

    pub fn cache_entry_count(&self) -> usize {
        self.cache.len()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute<F, Fut>(
        &self,
        provider: &str,
        model: &str,
        func: F,
        request_id: Option<String>,
        timeout_seconds: Option<f64>,
        add_session_context: bool,
        enforce_timeout: bool,
    ) -> Result<Value, SessionError>
    where
        F: FnOnce(ProviderCallContext) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let timeout = timeout_seconds.map(Duration::from_secs_f64).unwrap_or(self.default_timeout);
        let mut ctx = self.build_context(provider, model, timeout, None);
        if let Some(request_id) = request_id {
            ctx.request_id = request_id;
        }
        let session_id = ctx.session_id.clone();
        let request_id = ctx.request_id.clone();
        let started = Instant::now();

        let call = func(ctx);
        let outcome = if enforce_timeout {
            match tokio::time::timeout(timeout, call).await {
                Ok(inner) => inner.map_err(SessionError::Provider),
                Err(_) => {
                    tracing::warn!(session_id = %session_id, request_id = %request_id, ?timeout, "provider call timed out");
                    Err(SessionError::Timeout { session_id: session_id.clone(), request_id: request_id.clone(), timeout })
                }
            }
        } else {
            call.await.map_err(SessionError::Provider)
        };

        let mut response = outcome?;
        if add_session_context {
            inject_session_context(&mut response, &session_id, &request_id, started.elapsed().as_secs_f64());
        }
        Ok(response)
    }
}

fn inject_session_context(response: &mut Value, session_id: &str, request_id: &str, duration_seconds: f64) {
    let Value::Object(map) = response else { return };
    let metadata = map.entry("metadata").or_insert_with(|| json!({}));
    if let Value::Object(metadata) = metadata {
        metadata.insert(
            "session".to_string(),
            json!({ "sessionId": session_id, "requestId": request_id, "durationSeconds": duration_seconds }),
        );
    }
}
