//! In-process fallback tier.
//!
//! Isolate-local and lock-free (`DashMap`), bounded in entry count. When
//! full, expired buckets are dropped first and then the bucket with the
//! earliest reset is evicted. Last write wins on concurrent updates.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use capsule_state::RateLimitBucket;

use crate::bucket::{advance, merge, Hit, RateLimitRule};

#[derive(Debug, Clone)]
pub struct InProcessLimiter {
    buckets: Arc<DashMap<String, RateLimitBucket>>,
    max_entries: usize,
}

impl InProcessLimiter {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn peek(&self, key: &str) -> Option<RateLimitBucket> {
        self.buckets.get(key).map(|b| *b)
    }

    /// Apply a hit locally. Always answers.
    pub fn hit(&self, key: &str, rule: RateLimitRule, now_ms: u64) -> Hit {
        let hit = advance(self.peek(key), None, rule, now_ms);
        self.store(key, hit.bucket, now_ms);
        hit
    }

    /// Record a decision made by another tier.
    pub fn mirror(&self, key: &str, bucket: RateLimitBucket, now_ms: u64) {
        if let Some(merged) = merge(self.peek(key), Some(bucket)) {
            self.store(key, merged, now_ms);
        }
    }

    fn store(&self, key: &str, bucket: RateLimitBucket, now_ms: u64) {
        if !self.buckets.contains_key(key) && self.buckets.len() >= self.max_entries {
            self.make_room(now_ms);
        }
        self.buckets.insert(key.to_string(), bucket);
    }

    fn make_room(&self, now_ms: u64) {
        self.buckets.retain(|_, b| !b.is_expired(now_ms));
        while self.buckets.len() >= self.max_entries {
            let oldest = self
                .buckets
                .iter()
                .min_by_key(|entry| entry.value().reset_at_ms)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    debug!(key = %key, "evicting oldest in-process rate limit bucket");
                    self.buckets.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bounded_with_oldest_eviction() {
        let limiter = InProcessLimiter::new(2);
        let short = RateLimitRule {
            limit: 5,
            window: Duration::from_secs(10),
        };
        let long = RateLimitRule::per_minute(5);

        limiter.hit("old", short, 0);
        limiter.hit("new", long, 0);
        limiter.hit("third", long, 1);

        assert_eq!(limiter.len(), 2);
        assert!(limiter.peek("old").is_none());
        assert!(limiter.peek("new").is_some());
    }

    #[test]
    fn expired_entries_go_first() {
        let limiter = InProcessLimiter::new(2);
        let rule = RateLimitRule {
            limit: 5,
            window: Duration::from_millis(10),
        };
        limiter.hit("a", rule, 0);
        limiter.hit("b", RateLimitRule::per_minute(5), 0);
        limiter.hit("c", rule, 100);
        assert!(limiter.peek("a").is_none());
        assert!(limiter.peek("b").is_some());
    }

    #[test]
    fn mirror_keeps_most_advanced() {
        let limiter = InProcessLimiter::new(10);
        let rule = RateLimitRule::per_minute(5);
        limiter.hit("k", rule, 0);
        limiter.mirror(
            "k",
            RateLimitBucket {
                count: 4,
                reset_at_ms: 60_000,
            },
            1,
        );
        assert_eq!(limiter.peek("k").unwrap().count, 4);
        limiter.mirror(
            "k",
            RateLimitBucket {
                count: 2,
                reset_at_ms: 60_000,
            },
            2,
        );
        assert_eq!(limiter.peek("k").unwrap().count, 4);
    }
}
