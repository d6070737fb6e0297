pub mod analyze;
pub mod config;
pub mod egress;
pub mod imports;

use std::path::Path;

use anyhow::Context;
use capsule_analyzer::{analyze_files, analyze_zip, read_dir, AnalyzeOptions, ArchiveAnalysis};
use capsule_core::config::ArchiveConfig;

/// Analyze a `.zip` file or a project directory with default limits.
pub fn load(path: &Path, strip_root: bool) -> anyhow::Result<ArchiveAnalysis> {
    let limits = ArchiveConfig::default();
    if path.is_dir() {
        let files = read_dir(path, &limits).with_context(|| format!("reading {}", path.display()))?;
        tracing::debug!(path = %path.display(), files = files.len(), "read project directory");
        return Ok(analyze_files(files)?);
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let options = AnalyzeOptions {
        strip_prefix: None,
        strip_common_root: strip_root,
        limits,
    };
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read archive");
    Ok(analyze_zip(&bytes, &options)?)
}
