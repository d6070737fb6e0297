use std::path::Path;

use capsule_analyzer::{check_imports, ImportError};
use capsule_core::RunnerType;

/// Check a file set's imports against a runner tier. Exits non-zero on a
/// rejection, listing every offending specifier.
pub fn imports(path: &str, runner: Option<RunnerType>, strip_root: bool) -> anyhow::Result<()> {
    let analysis = super::load(Path::new(path), strip_root)?;
    let runner = runner.unwrap_or(analysis.runner);
    match check_imports(&analysis.files, runner) {
        Ok(report) => {
            println!("✓ {} files scanned for runner {runner}", report.files_scanned);
            for module in &report.modules {
                println!("  module  {module}");
            }
            for url in &report.url_modules {
                println!("  url     {url}");
            }
            for builtin in &report.builtins {
                println!("  builtin {builtin}");
            }
            Ok(())
        }
        Err(ImportError::Rejected { runner, violations }) => {
            eprintln!("✗ runner {runner} rejected {} import(s)", violations.len());
            for v in &violations {
                eprintln!("  {}:{}  {}  ({:?})", v.file, v.line, v.specifier, v.kind);
            }
            anyhow::bail!("import check failed")
        }
    }
}
