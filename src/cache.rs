use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const CACHE_TTL_SECONDS: u64 = 3600;
const FINGERPRINT_HEX_LEN: usize = 32;

/// Memoized non-streamed answer, stored as `{"result": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: String,
}

/// First 32 hex characters of SHA-256 over the trimmed text.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.trim().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

pub fn cache_key(model_id: &str, text: &str) -> String {
    format!("chat:{}:{}", model_id, fingerprint(text))
}

/// Best-effort memoization in front of the provider call. Store failures degrade to a miss.
#[derive(Clone)]
pub struct CacheGate {
    store: Arc<dyn KvStore>,
    ttl_seconds: u64,
}

impl CacheGate {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            ttl_seconds: CACHE_TTL_SECONDS,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub async fn lookup(&self, model_id: &str, text: &str) -> Option<CacheEntry> {
        let key = cache_key(model_id, text);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(cache_key = %key, "cache lookup failed: {err}");
                metrics::counter!("chatrouter_cache_lookups_total", "outcome" => "error")
                    .increment(1);
                return None;
            }
        };
        let entry = raw.and_then(|raw| match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(cache_key = %key, "ignoring undecodable cache entry: {err}");
                None
            }
        });
        let outcome = if entry.is_some() { "hit" } else { "miss" };
        metrics::counter!("chatrouter_cache_lookups_total", "outcome" => outcome).increment(1);
        tracing::debug!(cache_key = %key, outcome, "cache lookup");
        entry
    }

    pub async fn store(&self, model_id: &str, text: &str, answer: &str) {
        let key = cache_key(model_id, text);
        let entry = CacheEntry {
            result: answer.to_string(),
        };
        let value = match serde_json::to_string(&entry) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(cache_key = %key, "cache entry encode failed: {err}");
                return;
            }
        };
        if let Err(err) = self.store.put(&key, value, self.ttl_seconds).await {
            tracing::warn!(cache_key = %key, "cache store failed: {err}");
        }
    }
}
