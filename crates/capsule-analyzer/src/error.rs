//! Analyzer error types.

use capsule_core::ManifestError;
use thiserror::Error;

pub type AnalyzeResult<T> = Result<T, AnalyzeError>;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("archive has more than {limit} entries")]
    TooManyEntries { limit: usize },

    #[error("archive expands beyond {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("{path} expands beyond {limit} bytes")]
    FileTooLarge { path: String, limit: u64 },

    #[error("archive contains no files")]
    Empty,

    #[error("no entry point found: expected index.html, a nested build output such as dist/index.html, or any .html file")]
    NoEntryPoint,

    #[error("invalid manifest.json: {0}")]
    InvalidManifest(#[from] ManifestError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
