//! Periodic cleanup of expired limiter buckets and cache entries.
//!
//! Expired rows are already ignored on read; this only bounds growth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use capsule_ratelimit::now_ms;
use capsule_state::{MemoryKv, StateStore};

pub struct Sweeper {
    store: StateStore,
    kv: Arc<MemoryKv>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: StateStore, kv: Arc<MemoryKv>, interval: Duration) -> Self {
        Self { store, kv, interval }
    }

    /// One pass. Returns (limiter buckets, cache entries) removed.
    pub fn sweep(&self) -> (usize, usize) {
        let buckets = match self.store.purge_expired_rate_limits(now_ms()) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "rate limit purge failed");
                0
            }
        };
        let entries = self.kv.purge_expired();
        debug!(buckets, entries, "sweep complete");
        (buckets, entries)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    info!("sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_state::KvStore;

    #[tokio::test]
    async fn sweep_drops_expired_cache_entries() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("stale", b"1".to_vec(), Duration::ZERO).await.unwrap();
        kv.put("fresh", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        let sweeper = Sweeper::new(StateStore::open_in_memory().unwrap(), kv.clone(), Duration::from_secs(1));

        let (_, entries) = sweeper.sweep();
        assert_eq!(entries, 1);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let sweeper = Sweeper::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(MemoryKv::new()),
            Duration::from_secs(3600),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
