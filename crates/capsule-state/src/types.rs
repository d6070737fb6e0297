//! Persisted records of the capsule index.
//!
//! All records are JSON-serialized into redb value columns.

use serde::{Deserialize, Serialize};

use capsule_core::{
    ArtifactStatus, Manifest, PlanTier, PolicyStatus, Quarantine, RunnerType, UserId, Visibility,
};

// ── Capsule ────────────────────────────────────────────────────────

/// An immutable content-addressed bundle. Only `quarantine` changes after
/// insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleRecord {
    pub id: String,
    pub owner: UserId,
    /// Full hex content hash; blobs live under `capsules/{hash}/`.
    pub hash: String,
    pub manifest: Manifest,
    /// External modules found by the import check, for the import map.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<Quarantine>,
    pub created_at: u64,
}

impl CapsuleRecord {
    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}

// ── Artifact ───────────────────────────────────────────────────────

/// A runner-targeted derivative of a capsule with its own lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub owner: UserId,
    /// Owner's plan when the artifact was declared; its quotas gate the compile.
    #[serde(default)]
    pub plan: PlanTier,
    /// Set once the compile worker has content-addressed the sources.
    #[serde(default)]
    pub capsule_id: Option<String>,
    #[serde(rename = "type")]
    pub runner: RunnerType,
    pub runtime_version: String,
    /// Content hash of the compiled bundle; `None` while in draft.
    #[serde(default)]
    pub bundle_digest: Option<String>,
    pub status: ArtifactStatus,
    pub policy: PolicyStatus,
    pub visibility: Visibility,
    /// Size declared at upload intent; the sources upload must match it.
    pub declared_size: u64,
    /// Blob key of the uploaded sources archive, once received.
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<Quarantine>,
    /// Compile failure message when `status == failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ArtifactRecord {
    /// Servable to non-owners only when compiled and not policy-blocked.
    pub fn is_servable(&self) -> bool {
        self.status == ArtifactStatus::Active && !self.policy.is_blocking()
    }
}

/// Row of the capsule → artifact link table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactLink {
    pub artifact_id: String,
    pub policy: PolicyStatus,
}

// ── References ─────────────────────────────────────────────────────

/// A post (or other surface) that embeds a capsule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostReference {
    pub capsule_id: String,
    pub post_id: String,
    pub owner: UserId,
    pub visibility: Visibility,
    #[serde(default)]
    pub quarantined: bool,
    pub created_at: u64,
}

impl PostReference {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.capsule_id, self.post_id)
    }

    /// Counts toward public visibility of the referenced capsule.
    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public && !self.quarantined
    }
}

// ── Rate limiting ──────────────────────────────────────────────────

/// Fixed-window counter for one `{scope}:{identity}` key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub count: u32,
    /// Unix milliseconds at which the window ends.
    pub reset_at_ms: u64,
}

impl RateLimitBucket {
    /// A bucket past its reset is treated as absent.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }
}

/// Days since the unix epoch, the key granularity of build counters.
pub fn day_index(unix_secs: u64) -> u64 {
    unix_secs / 86_400
}
