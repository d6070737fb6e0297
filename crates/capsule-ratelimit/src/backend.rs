//! Backend tiers.
//!
//! Each tier answers a hit definitively or reports itself unavailable; the
//! limiter moves on to the next tier on any error.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use capsule_state::{KvStore, RateLimitBucket, StateError, StateStore};

use crate::bucket::{advance, Hit, RateLimitRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Actor,
    Relational,
    Kv,
    InProcess,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Actor => "actor",
            Tier::Relational => "relational",
            Tier::Kv => "kv",
            Tier::InProcess => "in_process",
        })
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(#[from] StateError),
}

#[async_trait]
pub trait LimiterBackend: Send + Sync {
    fn tier(&self) -> Tier;

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        floor: Option<RateLimitBucket>,
        now_ms: u64,
    ) -> Result<Hit, BackendError>;
}

// ── Relational ─────────────────────────────────────────────────────

/// Buckets in the redb `rate_limits` table; each hit is one write
/// transaction.
#[derive(Clone)]
pub struct RelationalBackend {
    store: StateStore,
}

impl RelationalBackend {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LimiterBackend for RelationalBackend {
    fn tier(&self) -> Tier {
        Tier::Relational
    }

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        floor: Option<RateLimitBucket>,
        now_ms: u64,
    ) -> Result<Hit, BackendError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Hit, BackendError> {
            let mut allowed = false;
            let bucket = store.update_rate_limit(&key, |current| {
                let hit = advance(current, floor, rule, now_ms);
                allowed = hit.allowed;
                hit.bucket
            })?;
            Ok(Hit { bucket, allowed })
        })
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?
    }
}

// ── KV cache ───────────────────────────────────────────────────────

/// Read-modify-write against a KV cache. Not atomic; concurrent hits on
/// one key may both be admitted, which the floor from the in-process
/// mirror bounds within a single process.
#[derive(Clone)]
pub struct KvBackend {
    kv: Arc<dyn KvStore>,
}

impl KvBackend {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn cache_key(key: &str) -> String {
        format!("rl:{key}")
    }
}

#[async_trait]
impl LimiterBackend for KvBackend {
    fn tier(&self) -> Tier {
        Tier::Kv
    }

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        floor: Option<RateLimitBucket>,
        now_ms: u64,
    ) -> Result<Hit, BackendError> {
        let cache_key = Self::cache_key(key);
        let current = match self.kv.get(&cache_key).await? {
            // An undecodable entry is stale data; start over.
            Some(bytes) => serde_json::from_slice::<RateLimitBucket>(&bytes).ok(),
            None => None,
        };
        let hit = advance(current, floor, rule, now_ms);
        let bytes = serde_json::to_vec(&hit.bucket)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let ttl = Duration::from_millis(hit.bucket.reset_at_ms.saturating_sub(now_ms).max(1));
        self.kv.put(&cache_key, bytes, ttl).await?;
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_state::MemoryKv;

    #[tokio::test]
    async fn relational_backend_persists_buckets() {
        let store = StateStore::open_in_memory().unwrap();
        let backend = RelationalBackend::new(store.clone());
        let rule = RateLimitRule::per_minute(1);

        assert!(backend.hit("ip:1", rule, None, 0).await.unwrap().allowed);
        assert!(!backend.hit("ip:1", rule, None, 10).await.unwrap().allowed);
        assert_eq!(store.get_rate_limit("ip:1").unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn kv_backend_counts_within_window() {
        let backend = KvBackend::new(Arc::new(MemoryKv::new()));
        let rule = RateLimitRule::per_minute(2);
        let now = crate::bucket::now_ms();

        assert!(backend.hit("k", rule, None, now).await.unwrap().allowed);
        assert!(backend.hit("k", rule, None, now + 1).await.unwrap().allowed);
        let third = backend.hit("k", rule, None, now + 2).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.bucket.count, 2);
    }
}
