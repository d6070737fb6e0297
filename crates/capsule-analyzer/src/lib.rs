//! capsule-analyzer — turns untrusted archives and source text into
//! validated inputs for the build pipeline.
//!
//! - [`archive`] extracts a zip (upload or repository snapshot) into a
//!   [`FileMap`](capsule_core::FileMap), detects the entry point, an embedded
//!   manifest hint, the license and server-side code markers.
//! - [`imports`] statically checks `import`/`require` specifiers against
//!   the runner tier's module allowance.
//! - [`local`] reads a directory from disk the same way (CLI use).

pub mod archive;
pub mod error;
pub mod imports;
pub mod license;
pub mod local;

pub use archive::{analyze_files, analyze_zip, write_zip, AnalysisWarning, AnalyzeOptions, ArchiveAnalysis};
pub use error::{AnalyzeError, AnalyzeResult};
pub use imports::{build_import_map, check_imports, ImportError, ImportReport, ImportViolation, ViolationKind};
pub use license::DetectedLicense;
pub use local::read_dir;
