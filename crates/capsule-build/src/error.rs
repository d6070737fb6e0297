use std::time::Duration;
use thiserror::Error;

use capsule_analyzer::{AnalyzeError, ImportError};
use capsule_core::ManifestError;
use capsule_pack::BundleError;
use capsule_state::StateError;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Analyze(#[from] AnalyzeError),

    #[error("{0}")]
    Imports(#[from] ImportError),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("{reason} quota exceeded: {current} of {limit}")]
    QuotaExceeded {
        reason: &'static str,
        limit: u64,
        current: u64,
    },

    #[error("bundle is {size} bytes, plan limit is {limit}")]
    BundleTooLarge { limit: u64, size: u64 },

    #[error("upload exceeds {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error("bundling failed: {0}")]
    Bundle(#[from] BundleError),

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("build timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Store(#[from] StateError),

    #[error("compile queue is full")]
    QueueFull,

    #[error("compile queue is closed")]
    QueueClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Analyze(AnalyzeError::InvalidManifest(_)) | BuildError::Manifest(_) => {
                "invalid_manifest"
            }
            BuildError::Analyze(AnalyzeError::NoEntryPoint) => "no_entry_point",
            BuildError::Analyze(AnalyzeError::Io(_)) => "analysis_failed",
            BuildError::Analyze(_) => "invalid_archive",
            BuildError::Imports(_) => "imports_rejected",
            BuildError::QuotaExceeded { .. } => "quota_exceeded",
            BuildError::BundleTooLarge { .. } => "bundle_too_large",
            BuildError::UploadTooLarge { .. } => "payload_too_large",
            BuildError::Bundle(_) => "bundle_failed",
            BuildError::InvalidSource(_) => "invalid_source",
            BuildError::Download(_) => "download_failed",
            BuildError::Timeout(_) => "build_timeout",
            BuildError::Store(_) => "storage_error",
            BuildError::QueueFull | BuildError::QueueClosed => "compile_enqueue_failed",
            BuildError::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BuildError::QuotaExceeded { .. }
                | BuildError::Download(_)
                | BuildError::QueueFull
                | BuildError::QueueClosed
        )
    }
}
