//! Key-value cache with per-entry TTL.
//!
//! Stands in for an edge KV service: best-effort, eventually consistent,
//! never the source of truth. Used by the manifest read path and as one
//! rate-limiter tier.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StateResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StateResult<()>;

    async fn delete(&self, key: &str) -> StateResult<()>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local KV; expired entries read as absent and are dropped lazily.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<DashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|e| (e.expires_at > now).then(|| e.value.clone()));
        match hit {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StateResult<()> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire() {
        let kv = MemoryKv::new();
        kv.put("a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        kv.put("b", b"2".to_vec(), Duration::ZERO).await.unwrap();

        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("b").await.unwrap(), None);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn purge_drops_expired() {
        let kv = MemoryKv::new();
        kv.put("a", b"1".to_vec(), Duration::ZERO).await.unwrap();
        kv.put("b", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.purge_expired(), 1);
        kv.delete("b").await.unwrap();
        assert!(kv.is_empty());
    }
}
