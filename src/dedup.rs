//! Connection-scoped message deduplication (C3).

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

struct Inner {
    client_id: Option<String>,
    seen: HashMap<String, Instant>,
}

/// Tracks recently sent message ids per connection, evicting entries older
/// than `ttl`.
pub struct MessageDeduplicator {
    inner: Mutex<Inner>,
    enabled: bool,
    ttl: Duration,
    use_fast_hash: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeduplicatorStats {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub total_tracked: usize,
}

impl MessageDeduplicator {
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self::with_hash_choice(ttl, enabled, true)
    }

    pub fn with_hash_choice(ttl: Duration, enabled: bool, use_fast_hash: bool) -> Self {
        Self {
            inner: Mutex::new(Inner { client_id: None, seen: HashMap::new() }),
            enabled,
            ttl,
            use_fast_hash,
        }
    }

    /// Scope subsequent `message_id` calls to this connection.
    pub fn set_current_client_id(&self, client_id: impl Into<String>) {
        self.inner.lock().expect("MessageDeduplicator mutex poisoned").client_id =
            Some(client_id.into());
    }

    /// Derive the identity used for dedup tracking: the message's own `id`
    /// field if present, else a stable hash of its canonical JSON prefixed
    /// by the current client id.
    pub fn message_id(&self, message: &serde_json::Value) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
        let client_id = self.inner.lock().expect("MessageDeduplicator mutex poisoned").client_id.clone();
        let canonical = canonical_json(message);
        let content = match client_id {
            Some(cid) => format!("{cid}:{canonical}"),
            None => canonical,
        };
        Some(self.hash(&content))
    }

    fn hash(&self, content: &str) -> String {
        if self.use_fast_hash {
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(content.as_bytes());
            format!("{:016x}", hasher.finish())
        } else {
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            let digest = hasher.finalize();
            digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
        }
    }

    /// Sweep expired entries, then check (and record) `id`. Returns true if
    /// `id` was already seen within the TTL window.
    pub fn is_duplicate(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("MessageDeduplicator mutex poisoned");
        let ttl = self.ttl;
        inner.seen.retain(|_, seen_at| seen_at.elapsed() <= ttl);
        if inner.seen.contains_key(id) {
            true
        } else {
            inner.seen.insert(id.to_string(), Instant::now());
            false
        }
    }

    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("MessageDeduplicator mutex poisoned");
        let ttl = self.ttl;
        let before = inner.seen.len();
        inner.seen.retain(|_, seen_at| seen_at.elapsed() <= ttl);
        before - inner.seen.len()
    }

    pub fn clear(&self) {
        self.inner.lock().expect("MessageDeduplicator mutex poisoned").seen.clear();
    }

    pub fn stats(&self) -> DeduplicatorStats {
        let inner = self.inner.lock().expect("MessageDeduplicator mutex poisoned");
        DeduplicatorStats {
            enabled: self.enabled,
            ttl_seconds: self.ttl.as_secs(),
            total_tracked: inner.seen.len(),
        }
    }
}

/// Serialize a JSON value with sorted object keys, so two semantically
/// identical messages always hash to the same content string.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted_map = serde_json::Map::new();
                for (k, v) in entries {
                    sorted_map.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(sorted_map)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_id_is_used_verbatim() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), true);
        let msg = json!({ "id": "abc", "data": "x" });
        assert_eq!(dedup.message_id(&msg).unwrap(), "abc");
    }

    #[test]
    fn disabled_deduplicator_returns_none() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), false);
        let msg = json!({ "data": "x" });
        assert!(dedup.message_id(&msg).is_none());
    }

    #[test]
    fn content_hash_is_scoped_by_client_id() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), true);
        let msg = json!({ "data": "x" });

        dedup.set_current_client_id("client-a");
        let id_a = dedup.message_id(&msg).unwrap();

        dedup.set_current_client_id("client-b");
        let id_b = dedup.message_id(&msg).unwrap();

        assert_ne!(id_a, id_b, "identical payloads from different clients must not collide");
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), true);
        dedup.set_current_client_id("client-a");

        let msg_a = json!({ "type": "t", "data": "x" });
        let msg_b = json!({ "data": "x", "type": "t" });

        assert_eq!(dedup.message_id(&msg_a).unwrap(), dedup.message_id(&msg_b).unwrap());
    }

    #[test]
    fn sha256_fallback_produces_stable_hash() {
        let dedup = MessageDeduplicator::with_hash_choice(Duration::from_secs(300), true, false);
        dedup.set_current_client_id("client-a");
        let msg = json!({ "data": "x" });
        let first = dedup.message_id(&msg).unwrap();
        let second = dedup.message_id(&msg).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64, "sha256 hex digest is 64 chars");
    }

    #[test]
    fn second_send_within_ttl_is_duplicate() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), true);
        assert!(!dedup.is_duplicate("m1"));
        assert!(dedup.is_duplicate("m1"));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let dedup = MessageDeduplicator::new(Duration::from_millis(10), true);
        assert!(!dedup.is_duplicate("m1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!dedup.is_duplicate("m1"), "expired id should no longer be a duplicate");
    }

    #[test]
    fn cleanup_expired_reports_count() {
        let dedup = MessageDeduplicator::new(Duration::from_millis(10), true);
        dedup.is_duplicate("m1");
        dedup.is_duplicate("m2");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(dedup.cleanup_expired(), 2);
    }

    #[test]
    fn clear_forgets_everything() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(300), true);
        dedup.is_duplicate("m1");
        dedup.clear();
        assert!(!dedup.is_duplicate("m1"));
    }
}
