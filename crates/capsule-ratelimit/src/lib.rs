//! capsule-ratelimit — fixed-window limiter with a degradation chain.
//!
//! Tiers, in order of decreasing consistency:
//!
//! 1. [`ShardedActors`]: per-key serialized tokio tasks
//! 2. [`RelationalBackend`]: the redb `rate_limits` table
//! 3. [`KvBackend`]: the edge KV cache
//! 4. [`InProcessLimiter`]: a bounded local map that always answers
//!
//! A tier that errors or times out is skipped. When nothing answers, the
//! caller's [`FailurePolicy`] decides.

mod backend;
mod bucket;
mod limiter;
mod memory;
mod shard;

pub use backend::{BackendError, KvBackend, LimiterBackend, RelationalBackend, Tier};
pub use bucket::{advance, merge, now_ms, Hit, RateLimitRule};
pub use limiter::{rate_limit_key, FailurePolicy, RateLimitDecision, TieredLimiter};
pub use memory::InProcessLimiter;
pub use shard::ShardedActors;
