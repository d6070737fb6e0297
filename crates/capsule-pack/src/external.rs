//! External bundler process.
//!
//! Pipeline:
//! 1. Write the input files into a fresh temporary `src/` directory
//! 2. Substitute `{src}`, `{out}`, `{entry}`, `{runner}` into the arguments
//! 3. Run the program with a deadline; the child is killed if the future is
//!    dropped or the deadline passes
//! 4. Read every file under `out/`; an optional `out/bundle.json`
//!    (`{"entry": "...", "warnings": [...]}`) carries the tool's report
//! 5. Pick the output entry: reported, else the input entry, else re-detect

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use capsule_analyzer::archive::entry_candidates;
use capsule_core::{is_safe_relative_path, FileMap};

use crate::{BundleError, BundleInput, BundleOutput, BundleResult, Bundler};

/// Report file the tool may leave in its output directory.
const REPORT_FILE: &str = "bundle.json";

const MAX_STDERR: usize = 4000;

#[derive(Debug, Default, Deserialize)]
struct BundleReport {
    entry: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExternalBundler {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalBundler {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    fn render_args(&self, src: &Path, out: &Path, input: &BundleInput) -> Vec<String> {
        let src = src.to_string_lossy();
        let out = out.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{src}", &src)
                    .replace("{out}", &out)
                    .replace("{entry}", &input.entry)
                    .replace("{runner}", input.runner.as_str())
            })
            .collect()
    }
}

#[async_trait]
impl Bundler for ExternalBundler {
    fn name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    async fn bundle(&self, input: &BundleInput) -> BundleResult<BundleOutput> {
        let workdir = tempfile::tempdir()?;
        let src = workdir.path().join("src");
        let out = workdir.path().join("out");
        tokio::fs::create_dir_all(&out).await?;
        write_tree(&src, &input.files).await?;

        let args = self.render_args(&src, &out, input);
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program = %self.program, ?args, "Running bundler");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| BundleError::Timeout(self.timeout))?
            .map_err(|e| BundleError::Spawn(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.chars().take(MAX_STDERR).collect();
            return Err(BundleError::Failed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let (mut files, report) = tokio::task::spawn_blocking(move || read_tree(&out))
            .await
            .map_err(|e| BundleError::Io(std::io::Error::other(e)))??;
        if files.is_empty() {
            return Err(BundleError::EmptyOutput);
        }
        files.remove(REPORT_FILE);

        let entry = match report.entry.map(|e| e.trim_start_matches("./").to_string()) {
            Some(reported) if files.contains_key(&reported) => reported,
            Some(reported) => {
                return Err(BundleError::InvalidOutput(format!(
                    "reported entry {reported} is not in the output"
                )));
            }
            None if files.contains_key(&input.entry) => input.entry.clone(),
            None => entry_candidates(&files)
                .into_iter()
                .next()
                .ok_or_else(|| BundleError::InvalidOutput("no entry point in output".into()))?,
        };

        info!(
            bundler = self.name(),
            files = files.len(),
            entry = %entry,
            warnings = report.warnings.len(),
            "Bundled sources"
        );
        Ok(BundleOutput {
            files,
            entry,
            warnings: report.warnings,
        })
    }
}

async fn write_tree(root: &Path, files: &FileMap) -> BundleResult<()> {
    for (path, bytes) in files {
        if !is_safe_relative_path(path) {
            return Err(BundleError::InvalidOutput(format!("unsafe input path {path}")));
        }
        let target: PathBuf = root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
    }
    Ok(())
}

fn read_tree(root: &Path) -> BundleResult<(FileMap, BundleReport)> {
    let mut files = FileMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| BundleError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative.to_string_lossy().replace('\\', "/");
        files.insert(path, std::fs::read(entry.path())?);
    }

    let report = match files.get(REPORT_FILE) {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| BundleError::InvalidOutput(format!("{REPORT_FILE}: {e}")))?,
        None => BundleReport::default(),
    };
    Ok((files, report))
}
