//! capsule-build — turns a source (upload, repository snapshot, snippet or
//! artifact sources) into a persisted capsule.
//!
//! [`BuildPipeline`] runs the staged build behind plan quota gates and
//! reports [`ProgressEvent`]s. [`CompileWorker`] drains the artifact
//! compile queue through the same pipeline.

pub mod compile;
pub mod error;
pub mod github;
pub mod pipeline;
pub mod progress;

pub use compile::{compile_queue, CompileJob, CompileQueue, CompileWorker};
pub use error::{BuildError, BuildResult};
pub use github::{parse_github_url, CodeloadFetcher, GithubSource, SnapshotFetcher};
pub use pipeline::{
    BuildOutcome, BuildPipeline, BuildRequest, BuildSource, WARN_BUNDLER_DEGRADED,
    WARN_BUNDLER_DIAGNOSTIC, WARN_ENTRY_CHANGED,
};
pub use progress::{ProgressEvent, ProgressSink, Stage};
