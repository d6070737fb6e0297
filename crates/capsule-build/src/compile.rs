//! Artifact compile queue and worker.
//!
//! `complete` enqueues an artifact id; the worker loads the uploaded
//! sources, runs them through the build pipeline for the artifact's runner
//! under the plan it was declared with, and moves the artifact
//! `draft → active`, or to `failed` with the error.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use capsule_core::{ArtifactStatus, PolicyStatus};
use capsule_state::ArtifactRecord;

use crate::error::{BuildError, BuildResult};
use crate::pipeline::{BuildPipeline, BuildRequest, BuildSource};
use crate::progress::ProgressSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub artifact_id: String,
}

/// Producer side of the bounded compile queue.
#[derive(Debug, Clone)]
pub struct CompileQueue {
    tx: mpsc::Sender<CompileJob>,
}

impl CompileQueue {
    /// Enqueue without waiting. A full or closed queue is reported to the
    /// caller rather than blocking the request.
    pub fn enqueue(&self, artifact_id: &str) -> BuildResult<()> {
        self.tx
            .try_send(CompileJob {
                artifact_id: artifact_id.to_string(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BuildError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BuildError::QueueClosed,
            })?;
        debug!(artifact = artifact_id, "compile job enqueued");
        Ok(())
    }
}

pub fn compile_queue(depth: usize) -> (CompileQueue, mpsc::Receiver<CompileJob>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (CompileQueue { tx }, rx)
}

pub struct CompileWorker {
    pipeline: BuildPipeline,
}

impl CompileWorker {
    pub fn new(pipeline: BuildPipeline) -> Self {
        Self { pipeline }
    }

    /// Drain jobs until the queue closes or shutdown is signalled.
    pub async fn run(self, mut rx: mpsc::Receiver<CompileJob>, mut shutdown: watch::Receiver<bool>) {
        info!("compile worker started");
        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    if let Err(e) = self.compile(&job.artifact_id).await {
                        warn!(artifact = %job.artifact_id, error = %e, "compile job failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("compile worker stopped");
    }

    /// Compile one artifact. Pipeline failures are recorded on the artifact
    /// and are not errors of this call; store failures are.
    pub async fn compile(&self, artifact_id: &str) -> BuildResult<ArtifactRecord> {
        let index = self.pipeline.content().index();
        let artifact = index
            .get_artifact(artifact_id)?
            .ok_or_else(|| BuildError::Internal(format!("artifact {artifact_id} not found")))?;
        if artifact.status != ArtifactStatus::Draft {
            debug!(artifact = artifact_id, status = ?artifact.status, "artifact already compiled");
            return Ok(artifact);
        }

        let outcome = match self.load_sources(&artifact).await {
            Ok(bytes) => {
                let request = BuildRequest {
                    owner: artifact.owner.clone(),
                    plan: Some(artifact.plan),
                    source: BuildSource::Zip {
                        bytes,
                        strip_common_root: true,
                    },
                    runner: Some(artifact.runner),
                };
                self.pipeline.run(request, &ProgressSink::none()).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(build) => {
                let capsule = build.capsule;
                let record = index.update_artifact(artifact_id, |a| {
                    a.capsule_id = Some(capsule.id.clone());
                    a.bundle_digest = Some(capsule.hash.clone());
                    a.status = ArtifactStatus::Active;
                    a.error = None;
                    if let Some(q) = &capsule.quarantine {
                        a.policy = PolicyStatus::Quarantined;
                        a.quarantine = Some(q.clone());
                    }
                    Ok(())
                })?;
                info!(
                    artifact = artifact_id,
                    capsule = %capsule.id,
                    policy = ?record.policy,
                    "artifact compiled"
                );
                Ok(record)
            }
            Err(e) if matches!(e, BuildError::Store(_)) => Err(e),
            Err(e) => {
                warn!(artifact = artifact_id, code = e.code(), error = %e, "artifact compile failed");
                let message = format!("{}: {e}", e.code());
                Ok(index.update_artifact(artifact_id, |a| {
                    a.status = ArtifactStatus::Failed;
                    a.error = Some(message);
                    Ok(())
                })?)
            }
        }
    }

    async fn load_sources(&self, artifact: &ArtifactRecord) -> BuildResult<Vec<u8>> {
        let key = artifact
            .source_key
            .as_deref()
            .ok_or_else(|| BuildError::InvalidSource("sources were never uploaded".into()))?;
        self.pipeline
            .content()
            .blobs()
            .get(key)
            .await?
            .ok_or_else(|| BuildError::InvalidSource(format!("sources missing at {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_analyzer::write_zip;
    use capsule_core::{CapsuleConfig, FileMap, PlanLimits, PlanTier, RunnerType, Visibility};
    use capsule_pack::PassthroughBundler;
    use capsule_state::{ContentStore, MemoryBlobStore, StateStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline_with(config: CapsuleConfig) -> BuildPipeline {
        let content = ContentStore::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(MemoryBlobStore::new()),
        );
        BuildPipeline::new(content, Arc::new(PassthroughBundler), Arc::new(config))
    }

    fn pipeline() -> BuildPipeline {
        pipeline_with(CapsuleConfig::default())
    }

    fn small_free_plan(max_bundle_bytes: u64, max_storage_bytes: u64) -> BuildPipeline {
        let mut config = CapsuleConfig::default();
        config.plans.insert(
            "free".into(),
            PlanLimits {
                max_bundle_bytes,
                max_storage_bytes,
                builds_per_day: 10,
                proxy_per_minute: 10,
            },
        );
        pipeline_with(config)
    }

    fn draft(id: &str, runner: RunnerType, source_key: Option<&str>) -> ArtifactRecord {
        ArtifactRecord {
            id: id.to_string(),
            owner: "alice".to_string(),
            plan: PlanTier::Free,
            capsule_id: None,
            runner,
            runtime_version: "1.0.0".to_string(),
            bundle_digest: None,
            status: ArtifactStatus::Draft,
            policy: PolicyStatus::Active,
            visibility: Visibility::Private,
            declared_size: 0,
            source_key: source_key.map(String::from),
            quarantine: None,
            error: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    async fn upload(p: &BuildPipeline, key: &str, entries: &[(&str, &str)]) {
        let files: FileMap = entries
            .iter()
            .map(|(k, v)| (format!("pkg/{k}"), v.as_bytes().to_vec()))
            .collect();
        p.content()
            .blobs()
            .put(key, &write_zip(&files).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compiles_draft_to_active() {
        let p = pipeline();
        upload(&p, "sources/a1", &[("index.html", "<script type=\"module\">import React from 'react';</script>")]).await;
        p.content()
            .index()
            .put_artifact(&draft("a1", RunnerType::ReactComponent, Some("sources/a1")))
            .unwrap();

        let record = CompileWorker::new(p.clone()).compile("a1").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Active);
        assert_eq!(record.policy, PolicyStatus::Active);
        let capsule_id = record.capsule_id.clone().unwrap();
        let capsule = p.content().index().get_capsule(&capsule_id).unwrap().unwrap();
        assert_eq!(capsule.manifest.runner, RunnerType::ReactComponent);
        assert_eq!(record.bundle_digest.as_deref(), Some(capsule.hash.as_str()));
        assert_eq!(capsule.modules, vec!["react"]);
    }

    #[tokio::test]
    async fn runner_tier_rejection_marks_failed() {
        let p = pipeline();
        upload(&p, "sources/a2", &[("index.html", "<script type=\"module\">import x from 'left-pad';</script>")]).await;
        p.content()
            .index()
            .put_artifact(&draft("a2", RunnerType::ClientStatic, Some("sources/a2")))
            .unwrap();

        let record = CompileWorker::new(p).compile("a2").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Failed);
        assert!(record.error.unwrap().contains("left-pad"));
        assert!(record.capsule_id.is_none());
    }

    #[tokio::test]
    async fn safety_hit_quarantines_artifact() {
        let p = pipeline();
        upload(&p, "sources/a3", &[("index.html", "<script>var m = new CoinHive.Anonymous('k');</script>")]).await;
        p.content()
            .index()
            .put_artifact(&draft("a3", RunnerType::ClientStatic, Some("sources/a3")))
            .unwrap();

        let record = CompileWorker::new(p.clone()).compile("a3").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Active);
        assert_eq!(record.policy, PolicyStatus::Quarantined);
        let links = p
            .content()
            .index()
            .artifacts_for_capsule(record.capsule_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(links[0].policy, PolicyStatus::Quarantined);
    }

    #[tokio::test]
    async fn expanded_bundle_over_plan_limit_fails() {
        let p = small_free_plan(1_000, 2_000);
        let page = format!("<p>{}</p>", "a".repeat(50_000));
        upload(&p, "sources/big", &[("index.html", page.as_str())]).await;
        let compressed = p.content().blobs().get("sources/big").await.unwrap().unwrap();
        assert!(compressed.len() < 1_000);
        p.content()
            .index()
            .put_artifact(&draft("big", RunnerType::ClientStatic, Some("sources/big")))
            .unwrap();

        let record = CompileWorker::new(p.clone()).compile("big").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Failed);
        assert!(record.error.unwrap().starts_with("bundle_too_large"));
        assert!(record.capsule_id.is_none());
        assert_eq!(p.content().index().storage_used("alice").unwrap(), 0);
    }

    #[tokio::test]
    async fn compile_respects_storage_quota() {
        let p = small_free_plan(1_000, 1_000);
        let page = format!("<p>{}</p>", "b".repeat(600));
        upload(&p, "sources/s1", &[("index.html", page.as_str())]).await;
        upload(&p, "sources/s2", &[("index.html", page.replace('b', "c").as_str())]).await;
        let index = p.content().index();
        index
            .put_artifact(&draft("s1", RunnerType::ClientStatic, Some("sources/s1")))
            .unwrap();
        index
            .put_artifact(&draft("s2", RunnerType::ClientStatic, Some("sources/s2")))
            .unwrap();

        let worker = CompileWorker::new(p.clone());
        assert_eq!(worker.compile("s1").await.unwrap().status, ArtifactStatus::Active);
        let second = worker.compile("s2").await.unwrap();
        assert_eq!(second.status, ArtifactStatus::Failed);
        assert!(second.error.unwrap().starts_with("quota_exceeded"));
    }

    #[tokio::test]
    async fn declared_plan_limits_apply() {
        let p = small_free_plan(1_000, 2_000);
        let page = format!("<p>{}</p>", "d".repeat(5_000));
        upload(&p, "sources/pro", &[("index.html", page.as_str())]).await;
        let mut record = draft("pro", RunnerType::ClientStatic, Some("sources/pro"));
        record.plan = PlanTier::Pro;
        p.content().index().put_artifact(&record).unwrap();

        let compiled = CompileWorker::new(p).compile("pro").await.unwrap();
        assert_eq!(compiled.status, ArtifactStatus::Active);
    }

    #[tokio::test]
    async fn missing_sources_fail_the_artifact() {
        let p = pipeline();
        p.content()
            .index()
            .put_artifact(&draft("a4", RunnerType::ClientStatic, None))
            .unwrap();
        let record = CompileWorker::new(p).compile("a4").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (queue, _rx) = compile_queue(1);
        queue.enqueue("a").unwrap();
        let err = queue.enqueue("b").unwrap_err();
        assert!(matches!(err, BuildError::QueueFull));
        assert_eq!(err.code(), "compile_enqueue_failed");
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (queue, rx) = compile_queue(4);
        drop(rx);
        assert!(matches!(queue.enqueue("a").unwrap_err(), BuildError::QueueClosed));
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_on_shutdown() {
        let p = pipeline();
        upload(&p, "sources/a5", &[("index.html", "<p>hi</p>")]).await;
        p.content()
            .index()
            .put_artifact(&draft("a5", RunnerType::ClientStatic, Some("sources/a5")))
            .unwrap();

        let (queue, rx) = compile_queue(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(CompileWorker::new(p.clone()).run(rx, shutdown_rx));
        queue.enqueue("a5").unwrap();

        let mut status = ArtifactStatus::Draft;
        for _ in 0..100 {
            status = p.content().index().get_artifact("a5").unwrap().unwrap().status;
            if status != ArtifactStatus::Draft {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ArtifactStatus::Active);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
