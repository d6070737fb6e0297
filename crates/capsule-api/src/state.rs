//! Shared handler state.

use std::sync::Arc;
use std::time::Duration;

use capsule_auth::IdentityVerifier;
use capsule_build::{BuildPipeline, CodeloadFetcher, CompileQueue, SnapshotFetcher};
use capsule_core::{Allowlist, CapsuleConfig};
use capsule_egress::EgressClient;
use capsule_ratelimit::TieredLimiter;
use capsule_state::{ContentStore, KvStore, StateStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CapsuleConfig>,
    pub pipeline: BuildPipeline,
    pub kv: Arc<dyn KvStore>,
    pub limiter: Arc<TieredLimiter>,
    pub verifier: Arc<IdentityVerifier>,
    pub egress: EgressClient,
    /// Deployment-wide egress ceiling, parsed once at startup.
    pub global_allowlist: Arc<Allowlist>,
    pub fetcher: Arc<dyn SnapshotFetcher>,
    pub compile_queue: CompileQueue,
}

impl AppState {
    /// State with the production GitHub fetcher and egress client.
    pub fn new(
        pipeline: BuildPipeline,
        kv: Arc<dyn KvStore>,
        limiter: Arc<TieredLimiter>,
        verifier: Arc<IdentityVerifier>,
        compile_queue: CompileQueue,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(pipeline.config().clone());
        let global_allowlist = Arc::new(config.egress_allowlist()?);
        let fetcher = CodeloadFetcher::new(
            config.import.github_codeload_base.clone(),
            Duration::from_secs(config.import.download_timeout_secs),
        )?;
        Ok(Self {
            egress: EgressClient::new(&config.egress),
            config,
            pipeline,
            kv,
            limiter,
            verifier,
            global_allowlist,
            fetcher: Arc::new(fetcher),
            compile_queue,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_egress(mut self, egress: EgressClient) -> Self {
        self.egress = egress;
        self
    }

    pub fn content(&self) -> &ContentStore {
        self.pipeline.content()
    }

    pub fn store(&self) -> &StateStore {
        self.pipeline.content().index()
    }
}
