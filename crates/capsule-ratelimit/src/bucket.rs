//! Window arithmetic shared by every backend.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capsule_state::RateLimitBucket;

/// `limit` hits per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Result of applying one hit to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub bucket: RateLimitBucket,
    pub allowed: bool,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The more advanced of two observations of the same key: a later window
/// wins, and within one window the higher count wins.
pub fn merge(a: Option<RateLimitBucket>, b: Option<RateLimitBucket>) -> Option<RateLimitBucket> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(a), Some(b)) => Some(if a.reset_at_ms != b.reset_at_ms {
            if a.reset_at_ms > b.reset_at_ms { a } else { b }
        } else if a.count >= b.count {
            a
        } else {
            b
        }),
    }
}

/// Apply one hit.
///
/// `existing` is the backend's own bucket and `floor` the last decision seen
/// by this process, so a backend that lags behind another tier can never
/// admit more than `limit` in one window. An expired bucket is treated as
/// absent and the window restarts with a count of 1. The count never
/// exceeds the limit.
pub fn advance(
    existing: Option<RateLimitBucket>,
    floor: Option<RateLimitBucket>,
    rule: RateLimitRule,
    now_ms: u64,
) -> Hit {
    let current = merge(existing, floor).filter(|b| !b.is_expired(now_ms));
    match current {
        None if rule.limit == 0 => Hit {
            bucket: RateLimitBucket {
                count: 0,
                reset_at_ms: now_ms + rule.window_ms(),
            },
            allowed: false,
        },
        None => Hit {
            bucket: RateLimitBucket {
                count: 1,
                reset_at_ms: now_ms + rule.window_ms(),
            },
            allowed: true,
        },
        Some(bucket) if bucket.count < rule.limit => Hit {
            bucket: RateLimitBucket {
                count: bucket.count + 1,
                reset_at_ms: bucket.reset_at_ms,
            },
            allowed: true,
        },
        Some(bucket) => Hit {
            bucket,
            allowed: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: RateLimitRule = RateLimitRule {
        limit: 2,
        window: Duration::from_secs(60),
    };

    #[test]
    fn counts_up_to_limit_then_denies() {
        let first = advance(None, None, RULE, 1_000);
        assert!(first.allowed);
        assert_eq!(first.bucket.count, 1);
        assert_eq!(first.bucket.reset_at_ms, 61_000);

        let second = advance(Some(first.bucket), None, RULE, 2_000);
        assert!(second.allowed);
        let third = advance(Some(second.bucket), None, RULE, 3_000);
        assert!(!third.allowed);
        assert_eq!(third.bucket.count, 2);
    }

    #[test]
    fn expired_bucket_restarts_at_one() {
        let full = RateLimitBucket {
            count: 2,
            reset_at_ms: 61_000,
        };
        let hit = advance(Some(full), None, RULE, 61_000);
        assert!(hit.allowed);
        assert_eq!(hit.bucket.count, 1);
        assert_eq!(hit.bucket.reset_at_ms, 121_000);
    }

    #[test]
    fn floor_wins_over_lagging_backend() {
        let stale = RateLimitBucket {
            count: 0,
            reset_at_ms: 61_000,
        };
        let seen = RateLimitBucket {
            count: 2,
            reset_at_ms: 61_000,
        };
        assert!(!advance(Some(stale), Some(seen), RULE, 5_000).allowed);
    }

    #[test]
    fn newer_window_wins_merge() {
        let old = RateLimitBucket {
            count: 9,
            reset_at_ms: 10,
        };
        let new = RateLimitBucket {
            count: 1,
            reset_at_ms: 20,
        };
        assert_eq!(merge(Some(old), Some(new)), Some(new));
        assert_eq!(merge(None, Some(old)), Some(old));
    }

    #[test]
    fn zero_limit_denies_everything() {
        let rule = RateLimitRule {
            limit: 0,
            ..RULE
        };
        assert!(!advance(None, None, rule, 0).allowed);
    }
}
