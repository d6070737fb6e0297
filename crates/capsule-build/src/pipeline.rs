//! Build pipeline orchestrator.
//!
//! `analyzing → bundling → safety_scan → manifest_build → persisting → done`,
//! with `failed` reachable from every stage. Quota gates run before any
//! work and again once the bundled size is known. Persisting is the only
//! stage with outside side effects, and a retried build is a fresh run.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use capsule_analyzer::{
    analyze_files, analyze_zip, check_imports, AnalysisWarning, AnalyzeOptions, ArchiveAnalysis,
};
use capsule_core::{
    unix_now, CapsuleConfig, FileMap, GenerateInput, Manifest, PlanLimits, PlanTier, RunnerType,
    UserId,
};
use capsule_guard::{scan_bundle, ScanReport};
use capsule_pack::{BundleInput, BundleOutput, Bundler};
use capsule_state::{day_index, CapsuleRecord, ContentStore, PublishRequest};

use crate::error::{BuildError, BuildResult};
use crate::progress::{ProgressSink, Stage};

pub const WARN_BUNDLER_DEGRADED: &str = "bundler_degraded";
pub const WARN_ENTRY_CHANGED: &str = "entry_changed";
pub const WARN_BUNDLER_DIAGNOSTIC: &str = "bundler_diagnostic";

#[derive(Debug, Clone)]
pub enum BuildSource {
    /// Uploaded archive or downloaded repository snapshot.
    Zip { bytes: Vec<u8>, strip_common_root: bool },
    /// Inline snippet or already-extracted tree.
    Files(FileMap),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub owner: UserId,
    /// Plan whose quotas gate this build; `None` when the gates were
    /// applied before the build was queued.
    pub plan: Option<PlanTier>,
    pub source: BuildSource,
    /// Overrides the runner from the embedded manifest or entry.
    pub runner: Option<RunnerType>,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub capsule: CapsuleRecord,
    pub deduplicated: bool,
    pub warnings: Vec<AnalysisWarning>,
    /// External modules, for the import map.
    pub modules: Vec<String>,
    pub safety: ScanReport,
}

#[derive(Clone)]
pub struct BuildPipeline {
    content: ContentStore,
    bundler: Arc<dyn Bundler>,
    config: Arc<CapsuleConfig>,
}

impl BuildPipeline {
    pub fn new(content: ContentStore, bundler: Arc<dyn Bundler>, config: Arc<CapsuleConfig>) -> Self {
        Self {
            content,
            bundler,
            config,
        }
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn config(&self) -> &CapsuleConfig {
        &self.config
    }

    /// Run a build to completion, reporting stages to `progress`. The
    /// streamed and single-response forms both come through here.
    pub async fn run(&self, request: BuildRequest, progress: &ProgressSink) -> BuildResult<BuildOutcome> {
        let timeout = Duration::from_secs(self.config.server.build_timeout_secs);
        let owner = request.owner.clone();
        let result = match tokio::time::timeout(timeout, self.stages(request, progress)).await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Timeout(timeout)),
        };
        match &result {
            Ok(outcome) => {
                progress
                    .emit(Stage::Done, Some(outcome.capsule.id.clone()))
                    .await
            }
            Err(e) => {
                warn!(owner = %owner, code = e.code(), error = %e, "build failed");
                progress.emit(Stage::Failed, Some(e.to_string())).await
            }
        }
        result
    }

    /// Per-plan gate checked before any work: builds today and storage.
    pub fn check_quota(&self, owner: &str, plan: PlanTier) -> BuildResult<PlanLimits> {
        let limits = self.config.limits_for(plan);
        let index = self.content.index();

        let builds = index.builds_on(owner, day_index(unix_now()))?;
        if builds >= limits.builds_per_day {
            return Err(BuildError::QuotaExceeded {
                reason: "builds_per_day",
                limit: limits.builds_per_day as u64,
                current: builds as u64,
            });
        }
        let used = index.storage_used(owner)?;
        if used >= limits.max_storage_bytes {
            return Err(BuildError::QuotaExceeded {
                reason: "storage",
                limit: limits.max_storage_bytes,
                current: used,
            });
        }
        Ok(limits)
    }

    async fn stages(&self, request: BuildRequest, progress: &ProgressSink) -> BuildResult<BuildOutcome> {
        let BuildRequest {
            owner,
            plan,
            source,
            runner,
        } = request;
        let limits = plan.map(|p| self.check_quota(&owner, p)).transpose()?;

        // ── Analyzing ──────────────────────────────────────────────
        progress.emit(Stage::Analyzing, None).await;
        let archive_limits = self.config.archive;
        let analysis = tokio::task::spawn_blocking(move || match source {
            BuildSource::Zip {
                bytes,
                strip_common_root,
            } => analyze_zip(
                &bytes,
                &AnalyzeOptions {
                    strip_prefix: None,
                    strip_common_root,
                    limits: archive_limits,
                },
            ),
            BuildSource::Files(files) => analyze_files(files),
        })
        .await
        .map_err(|e| BuildError::Internal(e.to_string()))??;

        let ArchiveAnalysis {
            files,
            total_size,
            entry,
            runner: detected_runner,
            hint,
            license,
            mut warnings,
            ..
        } = analysis;

        if let Some(limits) = &limits
            && total_size > limits.max_bundle_bytes
        {
            return Err(BuildError::BundleTooLarge {
                limit: limits.max_bundle_bytes,
                size: total_size,
            });
        }

        let runner = runner.unwrap_or(detected_runner);
        let imports = check_imports(&files, runner)?;
        progress
            .emit_at(
                Stage::Analyzing,
                0.15,
                Some(format!("{} files, entry {entry}", files.len())),
            )
            .await;

        // ── Bundling ───────────────────────────────────────────────
        progress
            .emit(Stage::Bundling, Some(self.bundler.name().to_string()))
            .await;
        let input = BundleInput {
            files,
            entry: entry.clone(),
            runner,
        };
        let result = self.bundler.bundle(&input).await;
        let bundled = match result {
            Ok(output) => output,
            Err(e) if self.config.bundler.allow_degraded => {
                warn!(bundler = self.bundler.name(), error = %e, "bundler failed, publishing raw files");
                warnings.push(AnalysisWarning::new(
                    WARN_BUNDLER_DEGRADED,
                    format!("bundler failed ({e}); files were published unbundled"),
                ));
                BundleOutput {
                    files: input.files,
                    entry: input.entry,
                    warnings: Vec::new(),
                }
            }
            Err(e) => return Err(e.into()),
        };
        for diagnostic in &bundled.warnings {
            warnings.push(AnalysisWarning::new(WARN_BUNDLER_DIAGNOSTIC, diagnostic.clone()));
        }
        if bundled.entry != entry {
            info!(from = %entry, to = %bundled.entry, "entry changed during bundling");
            warnings.push(AnalysisWarning::new(
                WARN_ENTRY_CHANGED,
                format!("entry changed from {entry} to {} during bundling", bundled.entry),
            ));
        }

        let bundle_size: u64 = bundled.files.values().map(|b| b.len() as u64).sum();
        if let Some(limits) = &limits {
            if bundle_size > limits.max_bundle_bytes {
                return Err(BuildError::BundleTooLarge {
                    limit: limits.max_bundle_bytes,
                    size: bundle_size,
                });
            }
            let used = self.content.index().storage_used(&owner)?;
            if used.saturating_add(bundle_size) > limits.max_storage_bytes {
                return Err(BuildError::QuotaExceeded {
                    reason: "storage",
                    limit: limits.max_storage_bytes,
                    current: used,
                });
            }
        }

        // ── Safety scan ────────────────────────────────────────────
        progress.emit(Stage::SafetyScan, None).await;
        let net = hint
            .as_ref()
            .and_then(|h| h.capabilities.as_ref())
            .and_then(|c| c.net.clone())
            .unwrap_or_default();
        let safety = scan_bundle(&bundled.files, &net);
        let quarantine = safety.quarantine(unix_now());
        if let Some(q) = &quarantine {
            warn!(owner = %owner, reason = %q.reason, "bundle flagged, publishing quarantined");
        }

        // ── Manifest ───────────────────────────────────────────────
        progress.emit(Stage::ManifestBuild, None).await;
        let manifest = Manifest::generate(
            hint.as_ref(),
            GenerateInput {
                runner,
                entry: &bundled.entry,
                files: &bundled.files,
                detected_license: license.as_ref().and_then(|l| l.spdx.as_deref()),
            },
        )?;

        // ── Persisting ─────────────────────────────────────────────
        progress.emit(Stage::Persisting, None).await;
        let published = self
            .content
            .publish(PublishRequest {
                owner: owner.clone(),
                manifest,
                files: bundled.files,
                modules: imports.modules.clone(),
                warnings: warnings.iter().map(|w| w.code.clone()).collect(),
                quarantine,
            })
            .await?;
        self.content
            .index()
            .record_build(&owner, day_index(unix_now()))?;

        info!(
            id = %published.capsule.id,
            owner = %owner,
            runner = %runner,
            size = bundle_size,
            deduplicated = published.deduplicated,
            warnings = warnings.len(),
            "build complete"
        );
        Ok(BuildOutcome {
            capsule: published.capsule,
            deduplicated: published.deduplicated,
            warnings,
            modules: imports.modules,
            safety,
        })
    }
}
