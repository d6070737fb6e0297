//! Serialized per-key actor shards.
//!
//! Keys hash onto a fixed set of tokio tasks; each task owns its buckets
//! outright, so hits on one key are applied strictly in arrival order.
//! Each shard drops expired buckets on a timer and holds at most a fixed
//! number of keys, evicting the earliest-resetting bucket when full.

use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use capsule_state::RateLimitBucket;

use crate::backend::{BackendError, LimiterBackend, Tier};
use crate::bucket::{advance, Hit, RateLimitRule};

const SHARD_MAILBOX: usize = 1024;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-shard key capacity.
pub const MAX_KEYS_PER_SHARD: usize = 65_536;

struct HitRequest {
    key: String,
    rule: RateLimitRule,
    floor: Option<RateLimitBucket>,
    now_ms: u64,
    reply: oneshot::Sender<Hit>,
}

pub struct ShardedActors {
    shards: Vec<mpsc::Sender<HitRequest>>,
    handles: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl ShardedActors {
    /// Spawn `count` shard tasks on the current runtime.
    pub fn spawn(count: usize, timeout: Duration) -> Self {
        Self::spawn_bounded(count, timeout, MAX_KEYS_PER_SHARD)
    }

    /// Spawn shards that each hold at most `max_keys` buckets.
    pub fn spawn_bounded(count: usize, timeout: Duration, max_keys: usize) -> Self {
        let count = count.max(1);
        let max_keys = max_keys.max(1);
        let mut shards = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::channel(SHARD_MAILBOX);
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(index, rx, max_keys)));
        }
        debug!(shards = count, "rate limit shards started");
        Self {
            shards,
            handles,
            timeout,
        }
    }

    /// Abort every shard task. Later hits report the tier unavailable.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    fn shard_for(&self, key: &str) -> &mpsc::Sender<HitRequest> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

impl Drop for ShardedActors {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_shard(index: usize, mut rx: mpsc::Receiver<HitRequest>, max_keys: usize) {
    let mut buckets: HashMap<String, RateLimitBucket> = HashMap::new();
    let mut latest_ms = 0;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                latest_ms = latest_ms.max(request.now_ms);
                if !buckets.contains_key(&request.key) && buckets.len() >= max_keys {
                    make_room(index, &mut buckets, request.now_ms, max_keys);
                }
                let hit = advance(
                    buckets.get(&request.key).copied(),
                    request.floor,
                    request.rule,
                    request.now_ms,
                );
                buckets.insert(request.key, hit.bucket);
                // The caller may have timed out and gone away.
                let _ = request.reply.send(hit);
            }
            _ = sweep.tick() => {
                let before = buckets.len();
                buckets.retain(|_, b| !b.is_expired(latest_ms));
                if buckets.len() < before {
                    debug!(shard = index, dropped = before - buckets.len(), "swept expired buckets");
                }
            }
        }
    }
    debug!(shard = index, "rate limit shard stopped");
}

fn make_room(index: usize, buckets: &mut HashMap<String, RateLimitBucket>, now_ms: u64, max_keys: usize) {
    buckets.retain(|_, b| !b.is_expired(now_ms));
    while buckets.len() >= max_keys {
        let Some(oldest) = buckets
            .iter()
            .min_by_key(|(_, b)| b.reset_at_ms)
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        debug!(shard = index, key = %oldest, "evicting oldest shard bucket");
        buckets.remove(&oldest);
    }
}

#[async_trait]
impl LimiterBackend for ShardedActors {
    fn tier(&self) -> Tier {
        Tier::Actor
    }

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        floor: Option<RateLimitBucket>,
        now_ms: u64,
    ) -> Result<Hit, BackendError> {
        let (reply, rx) = oneshot::channel();
        let request = HitRequest {
            key: key.to_string(),
            rule,
            floor,
            now_ms,
            reply,
        };
        let exchange = async {
            self.shard_for(key)
                .send(request)
                .await
                .map_err(|_| BackendError::Unavailable("shard stopped".into()))?;
            rx.await
                .map_err(|_| BackendError::Unavailable("shard dropped request".into()))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_hits_per_key() {
        let actors = ShardedActors::spawn(4, Duration::from_secs(1));
        let rule = RateLimitRule::per_minute(3);
        let mut allowed = 0;
        for i in 0..5 {
            if actors.hit("user:a", rule, None, i).await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
        assert!(actors.hit("user:b", rule, None, 5).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn full_shard_evicts_earliest_reset() {
        let actors = ShardedActors::spawn_bounded(1, Duration::from_secs(1), 2);
        let rule = RateLimitRule::per_minute(1);
        assert!(actors.hit("a", rule, None, 0).await.unwrap().allowed);
        assert!(actors.hit("b", rule, None, 10).await.unwrap().allowed);
        // A third key pushes out "a", whose window resets first.
        assert!(actors.hit("c", rule, None, 20).await.unwrap().allowed);
        assert!(!actors.hit("c", rule, None, 25).await.unwrap().allowed);
        assert!(!actors.hit("b", rule, None, 30).await.unwrap().allowed);
        assert!(actors.hit("a", rule, None, 40).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn expired_buckets_free_capacity_before_eviction() {
        let actors = ShardedActors::spawn_bounded(1, Duration::from_secs(1), 2);
        let rule = RateLimitRule::per_minute(1);
        assert!(actors.hit("a", rule, None, 0).await.unwrap().allowed);
        assert!(actors.hit("b", rule, None, 50_000).await.unwrap().allowed);
        // "a" has expired by now, so "c" takes its slot and "b" survives.
        assert!(actors.hit("c", rule, None, 70_000).await.unwrap().allowed);
        assert!(!actors.hit("b", rule, None, 70_001).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn stopped_shards_are_unavailable() {
        let actors = ShardedActors::spawn(1, Duration::from_millis(200));
        actors.stop();
        tokio::task::yield_now().await;
        let err = actors
            .hit("k", RateLimitRule::per_minute(1), None, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Unavailable(_) | BackendError::Timeout(_)
        ));
    }
}
