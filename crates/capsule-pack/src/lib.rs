//! capsule-pack — the bundling step of the build pipeline.
//!
//! Bundling is delegated to an external tool that tree-shakes/transpiles a
//! source tree and writes the result to an output directory. The tool is a
//! black box behind the [`Bundler`] trait:
//!
//! - [`ExternalBundler`] runs a configured program with `{src}`, `{out}`,
//!   `{entry}` and `{runner}` substituted into its arguments.
//! - [`PassthroughBundler`] returns the input unchanged; used when no
//!   program is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use capsule_core::config::BundlerConfig;
use capsule_core::{FileMap, RunnerType};

mod external;

pub use external::ExternalBundler;

pub type BundleResult<T> = Result<T, BundleError>;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to start bundler: {0}")]
    Spawn(String),

    #[error("bundler timed out after {0:?}")]
    Timeout(Duration),

    #[error("bundler exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("bundler produced no files")]
    EmptyOutput,

    #[error("invalid bundler output: {0}")]
    InvalidOutput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the pipeline hands the bundler.
#[derive(Debug, Clone)]
pub struct BundleInput {
    pub files: FileMap,
    pub entry: String,
    pub runner: RunnerType,
}

/// Bundled files; these replace the raw files for every later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleOutput {
    pub files: FileMap,
    /// Entry in the output; may differ from the input entry.
    pub entry: String,
    /// Diagnostics reported by the tool.
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait Bundler: Send + Sync {
    fn name(&self) -> &str;

    async fn bundle(&self, input: &BundleInput) -> BundleResult<BundleOutput>;
}

/// Returns the input files untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughBundler;

#[async_trait]
impl Bundler for PassthroughBundler {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn bundle(&self, input: &BundleInput) -> BundleResult<BundleOutput> {
        Ok(BundleOutput {
            files: input.files.clone(),
            entry: input.entry.clone(),
            warnings: Vec::new(),
        })
    }
}

/// Bundler selected by `[bundler]` configuration.
pub fn from_config(config: &BundlerConfig) -> Arc<dyn Bundler> {
    match &config.program {
        Some(program) => {
            tracing::info!(program = %program, "Using external bundler");
            Arc::new(ExternalBundler::new(
                program.clone(),
                config.args.clone(),
                Duration::from_secs(config.timeout_secs),
            ))
        }
        None => {
            tracing::info!("No bundler configured; files pass through unchanged");
            Arc::new(PassthroughBundler)
        }
    }
}
