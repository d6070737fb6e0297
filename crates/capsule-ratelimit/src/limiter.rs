//! The fallback chain.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use capsule_core::config::RateLimitConfig;
use capsule_state::{KvStore, StateStore};

use crate::backend::{KvBackend, LimiterBackend, RelationalBackend, Tier};
use crate::bucket::{now_ms, Hit, RateLimitRule};
use crate::memory::InProcessLimiter;
use crate::shard::ShardedActors;

/// What to answer when no tier can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Deny. Used for the egress proxy.
    Closed,
    /// Allow. Used for public reads.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    /// Tier that answered; `None` when every tier was unavailable and the
    /// failure policy decided.
    pub tier: Option<Tier>,
}

impl RateLimitDecision {
    fn from_hit(hit: Hit, rule: RateLimitRule, tier: Tier) -> Self {
        Self {
            allowed: hit.allowed,
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(hit.bucket.count),
            reset_at_ms: hit.bucket.reset_at_ms,
            tier: Some(tier),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.tier.is_none()
    }

    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }

    /// Unix seconds at which the window resets.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

/// `{scope}:{identity}` key.
pub fn rate_limit_key(scope: &str, identity: &str) -> String {
    format!("{scope}:{identity}")
}

/// Tries each backend in order; the first definitive answer wins.
///
/// Every answer is mirrored into the in-process map, and the mirrored
/// bucket is handed to the next tier as a floor, so failing over between
/// tiers never admits more than the limit in one window.
pub struct TieredLimiter {
    backends: Vec<Arc<dyn LimiterBackend>>,
    local: InProcessLimiter,
    /// Whether the in-process map may answer on its own.
    local_answers: bool,
}

impl TieredLimiter {
    pub fn new(
        backends: Vec<Arc<dyn LimiterBackend>>,
        local: InProcessLimiter,
        local_answers: bool,
    ) -> Self {
        Self {
            backends,
            local,
            local_answers,
        }
    }

    /// Build the chain selected by `[rate_limit]`. Spawns actor shards, so
    /// it must run inside a tokio runtime.
    pub fn from_config(config: &RateLimitConfig, store: StateStore, kv: Arc<dyn KvStore>) -> Self {
        let mut backends: Vec<Arc<dyn LimiterBackend>> = Vec::new();
        if config.shards > 0 {
            backends.push(Arc::new(ShardedActors::spawn(
                config.shards,
                Duration::from_millis(config.shard_timeout_ms),
            )));
        }
        if config.relational {
            backends.push(Arc::new(RelationalBackend::new(store)));
        }
        if config.kv_cache {
            backends.push(Arc::new(KvBackend::new(kv)));
        }
        Self::new(
            backends,
            InProcessLimiter::new(config.in_process_max_entries),
            config.in_process,
        )
    }

    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self.backends.iter().map(|b| b.tier()).collect();
        if self.local_answers {
            tiers.push(Tier::InProcess);
        }
        tiers
    }

    pub async fn check(&self, key: &str, rule: RateLimitRule, policy: FailurePolicy) -> RateLimitDecision {
        self.check_at(key, rule, policy, now_ms()).await
    }

    pub async fn check_at(
        &self,
        key: &str,
        rule: RateLimitRule,
        policy: FailurePolicy,
        now_ms: u64,
    ) -> RateLimitDecision {
        let floor = self.local.peek(key);
        for backend in &self.backends {
            match backend.hit(key, rule, floor, now_ms).await {
                Ok(hit) => {
                    self.local.mirror(key, hit.bucket, now_ms);
                    if !hit.allowed {
                        debug!(key, tier = %backend.tier(), "rate limited");
                    }
                    return RateLimitDecision::from_hit(hit, rule, backend.tier());
                }
                Err(e) => {
                    warn!(key, tier = %backend.tier(), error = %e, "rate limit tier unavailable, falling back");
                }
            }
        }

        if self.local_answers {
            let hit = self.local.hit(key, rule, now_ms);
            return RateLimitDecision::from_hit(hit, rule, Tier::InProcess);
        }

        warn!(key, ?policy, "every rate limit tier unavailable");
        RateLimitDecision {
            allowed: policy == FailurePolicy::Open,
            limit: rule.limit,
            remaining: 0,
            reset_at_ms: now_ms + rule.window_ms(),
            tier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use capsule_state::{MemoryKv, RateLimitBucket};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend that can be switched off mid-test.
    struct Switchable {
        inner: Arc<dyn LimiterBackend>,
        down: AtomicBool,
    }

    impl Switchable {
        fn new(inner: Arc<dyn LimiterBackend>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LimiterBackend for Switchable {
        fn tier(&self) -> Tier {
            self.inner.tier()
        }

        async fn hit(
            &self,
            key: &str,
            rule: RateLimitRule,
            floor: Option<RateLimitBucket>,
            now_ms: u64,
        ) -> Result<Hit, BackendError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("switched off".into()));
            }
            self.inner.hit(key, rule, floor, now_ms).await
        }
    }

    #[tokio::test]
    async fn first_available_tier_answers() {
        let store = StateStore::open_in_memory().unwrap();
        let actors = Switchable::new(Arc::new(ShardedActors::spawn(2, Duration::from_secs(1))));
        let limiter = TieredLimiter::new(
            vec![actors.clone(), Arc::new(RelationalBackend::new(store))],
            InProcessLimiter::new(100),
            true,
        );
        let rule = RateLimitRule::per_minute(10);

        let d = limiter.check_at("k", rule, FailurePolicy::Closed, 0).await;
        assert_eq!(d.tier, Some(Tier::Actor));
        assert_eq!(d.remaining, 9);

        actors.down.store(true, Ordering::SeqCst);
        let d = limiter.check_at("k", rule, FailurePolicy::Closed, 1).await;
        assert_eq!(d.tier, Some(Tier::Relational));
    }

    #[tokio::test]
    async fn failover_never_exceeds_limit() {
        let store = StateStore::open_in_memory().unwrap();
        let actors = Switchable::new(Arc::new(ShardedActors::spawn(2, Duration::from_secs(1))));
        let relational = Switchable::new(Arc::new(RelationalBackend::new(store)));
        let kv = Switchable::new(Arc::new(KvBackend::new(Arc::new(MemoryKv::new()))));
        let limiter = TieredLimiter::new(
            vec![actors.clone(), relational.clone(), kv.clone()],
            InProcessLimiter::new(100),
            true,
        );
        let rule = RateLimitRule::per_minute(6);
        let now = now_ms();
        let mut allowed = 0;

        for i in 0..12u64 {
            match i {
                2 => actors.down.store(true, Ordering::SeqCst),
                4 => relational.down.store(true, Ordering::SeqCst),
                6 => kv.down.store(true, Ordering::SeqCst),
                _ => {}
            }
            if limiter.check_at("owner:a", rule, FailurePolicy::Closed, now + i).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 6);
    }

    #[tokio::test]
    async fn exhausted_chain_follows_policy() {
        let dead = Switchable::new(Arc::new(ShardedActors::spawn(1, Duration::from_secs(1))));
        dead.down.store(true, Ordering::SeqCst);
        let limiter = TieredLimiter::new(vec![dead], InProcessLimiter::new(10), false);
        let rule = RateLimitRule::per_minute(100);

        let closed = limiter.check_at("k", rule, FailurePolicy::Closed, 0).await;
        assert!(!closed.allowed);
        assert!(closed.is_unavailable());

        let open = limiter.check_at("k", rule, FailurePolicy::Open, 0).await;
        assert!(open.allowed);
        assert!(open.is_unavailable());
    }

    #[tokio::test]
    async fn hundred_and_first_request_gets_retry_after() {
        let limiter = TieredLimiter::new(Vec::new(), InProcessLimiter::new(10), true);
        let rule = RateLimitRule::per_minute(100);
        let start = 1_000_000;
        for i in 0..100 {
            assert!(limiter.check_at("ip:1", rule, FailurePolicy::Closed, start + i).await.allowed);
        }
        let now = start + 20_000;
        let denied = limiter.check_at("ip:1", rule, FailurePolicy::Closed, now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs(now), 40);
    }

    #[tokio::test]
    async fn from_config_builds_full_chain() {
        let limiter = TieredLimiter::from_config(
            &RateLimitConfig::default(),
            StateStore::open_in_memory().unwrap(),
            Arc::new(MemoryKv::new()),
        );
        assert_eq!(
            limiter.tiers(),
            vec![Tier::Actor, Tier::Relational, Tier::Kv, Tier::InProcess]
        );
    }
}
