//! Issuer key sets, fetched remotely and cached per URL with a TTL.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{AuthError, AuthResult};

#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch(&self, url: &str) -> AuthResult<JwkSet>;
}

/// Fetches key sets over HTTPS.
#[derive(Clone)]
pub struct HttpKeySetSource {
    client: reqwest::Client,
}

impl HttpKeySetSource {
    pub fn new(timeout: Duration) -> AuthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::KeySet(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self, url: &str) -> AuthResult<JwkSet> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::KeySet(e.to_string()))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySet(e.to_string()))
    }
}

struct CachedSet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Process-wide key set cache. Safe to lose: a miss just refetches.
pub struct JwksCache {
    source: Arc<dyn KeySetSource>,
    ttl: Duration,
    sets: DashMap<String, CachedSet>,
}

impl JwksCache {
    pub fn new(source: Arc<dyn KeySetSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            sets: DashMap::new(),
        }
    }

    /// Cached set for `url`, fetched if absent or stale.
    pub async fn get(&self, url: &str) -> AuthResult<Arc<JwkSet>> {
        if let Some(cached) = self.sets.get(url)
            && cached.fetched_at.elapsed() < self.ttl
        {
            debug!(url, "key set cache hit");
            return Ok(cached.keys.clone());
        }
        self.refresh(url).await
    }

    /// Fetch `url` unconditionally and replace the cached set.
    pub async fn refresh(&self, url: &str) -> AuthResult<Arc<JwkSet>> {
        let keys = Arc::new(self.source.fetch(url).await?);
        info!(url, keys = keys.keys.len(), "key set fetched");
        self.sets.insert(
            url.to_string(),
            CachedSet {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }

    /// Key `kid` from the set at `url`. An unknown id triggers exactly one
    /// forced refresh, so rotated keys are picked up before failing.
    pub async fn find(&self, url: &str, kid: &str) -> AuthResult<Jwk> {
        let keys = self.get(url).await?;
        if let Some(jwk) = keys.find(kid) {
            return Ok(jwk.clone());
        }
        debug!(url, kid, "unknown key id, refreshing key set");
        let keys = self.refresh(url).await?;
        keys.find(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }
}
