//! Archive analyzer — zip bytes (upload or repository snapshot) to a
//! [`FileMap`] plus everything the build pipeline needs to know about it.
//!
//! Entry sizes in the zip headers are never trusted: every file is read
//! through a bounded reader and the configured limits are enforced on the
//! bytes actually produced.

use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use capsule_core::config::ArchiveConfig;
use capsule_core::{is_safe_relative_path, FileMap, ManifestHint, RunnerType};

use crate::error::{AnalyzeError, AnalyzeResult};
use crate::license::{self, DetectedLicense};

pub const MANIFEST_FILE: &str = "manifest.json";

pub const WARN_MANIFEST_ENTRY_MISSING: &str = "manifest_entry_missing";
pub const WARN_SERVER_CODE: &str = "server_code_detected";
pub const WARN_LICENSE_MISSING: &str = "license_missing";
pub const WARN_LICENSE_UNRECOGNIZED: &str = "license_unrecognized";
pub const WARN_UNSAFE_PATH: &str = "unsafe_path_skipped";

/// Dependency caches, VCS metadata and OS junk. Dot-prefixed segments are
/// skipped separately.
const NOISE_DIRS: &[&str] = &[
    "node_modules",
    "bower_components",
    "jspm_packages",
    "__pycache__",
    "__MACOSX",
];

/// Conventional entry points, highest priority first.
const ENTRY_PRIORITY: &[&str] = &[
    "index.html",
    "dist/index.html",
    "build/index.html",
    "public/index.html",
    "out/index.html",
    "docs/index.html",
    "src/index.html",
    "index.jsx",
    "index.tsx",
    "App.jsx",
    "App.tsx",
    "src/App.jsx",
    "src/App.tsx",
    "src/main.jsx",
    "src/main.tsx",
    "src/index.jsx",
    "src/index.tsx",
];

const SERVER_FILE_NAMES: &[&str] = &[
    "server.js",
    "server.ts",
    "server.mjs",
    "server.cjs",
    "Procfile",
    "Dockerfile",
    "serverless.yml",
    "serverless.yaml",
];

const SERVER_EXTENSIONS: &[&str] = &[".php", ".py", ".rb"];

const SERVER_DIRS: &[&str] = &[
    "api/",
    "server/",
    "functions/",
    "netlify/functions/",
    "pages/api/",
    "app/api/",
];

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Only entries under this prefix are kept, with the prefix removed.
    pub strip_prefix: Option<String>,
    /// Drop a single top-level directory shared by every entry (repository
    /// snapshots wrap everything in `<repo>-<ref>/`).
    pub strip_common_root: bool,
    pub limits: ArchiveConfig,
}

/// Non-fatal finding attached to an analysis or build result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    pub code: String,
    pub message: String,
}

impl AnalysisWarning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveAnalysis {
    pub files: FileMap,
    pub total_size: u64,
    /// Chosen entry point; always a key of `files`.
    pub entry: String,
    /// Every conventional entry found, in priority order.
    pub entry_candidates: Vec<String>,
    /// Runner from the hint, or inferred from the entry.
    pub runner: RunnerType,
    pub hint: Option<ManifestHint>,
    pub license: Option<DetectedLicense>,
    pub has_server_code: bool,
    pub server_paths: Vec<String>,
    pub warnings: Vec<AnalysisWarning>,
}

impl ArchiveAnalysis {
    /// SPDX id of a recognized license file.
    pub fn detected_license(&self) -> Option<&str> {
        self.license.as_ref().and_then(|l| l.spdx.as_deref())
    }
}

/// Extract and analyze a zip archive.
pub fn analyze_zip(bytes: &[u8], options: &AnalyzeOptions) -> AnalyzeResult<ArchiveAnalysis> {
    let (files, mut warnings) = extract_zip(bytes, options)?;
    let mut analysis = analyze_files(files)?;
    warnings.append(&mut analysis.warnings);
    analysis.warnings = warnings;
    Ok(analysis)
}

/// Analyze an in-memory file set (inline snippet, local directory, or an
/// extracted archive).
pub fn analyze_files(files: FileMap) -> AnalyzeResult<ArchiveAnalysis> {
    let mut warnings = Vec::new();
    let files: FileMap = files
        .into_iter()
        .filter(|(path, _)| {
            if !is_safe_relative_path(path) {
                warnings.push(unsafe_path_warning(path));
                return false;
            }
            !is_ignored(path)
        })
        .collect();
    if files.is_empty() {
        return Err(AnalyzeError::Empty);
    }

    let hint = files
        .get(MANIFEST_FILE)
        .map(|bytes| ManifestHint::parse(bytes))
        .transpose()?;

    let entry_candidates = entry_candidates(&files);
    let hinted_entry = hint.as_ref().and_then(ManifestHint::normalized_entry);
    let entry = match hinted_entry {
        Some(declared) if files.contains_key(&declared) => declared,
        Some(declared) => {
            warnings.push(AnalysisWarning::new(
                WARN_MANIFEST_ENTRY_MISSING,
                format!("manifest entry {declared} is not in the archive; using detected entry"),
            ));
            entry_candidates.first().cloned().ok_or(AnalyzeError::NoEntryPoint)?
        }
        None => entry_candidates.first().cloned().ok_or(AnalyzeError::NoEntryPoint)?,
    };

    let runner = hint
        .as_ref()
        .and_then(|h| h.runner)
        .unwrap_or_else(|| RunnerType::infer_from_entry(&entry));

    let server_paths: Vec<String> = files
        .keys()
        .filter(|p| is_server_path(p))
        .cloned()
        .collect();
    if !server_paths.is_empty() {
        let shown: Vec<&str> = server_paths.iter().take(5).map(String::as_str).collect();
        warnings.push(AnalysisWarning::new(
            WARN_SERVER_CODE,
            format!(
                "server-side code found ({}); only client-executable code will run",
                shown.join(", ")
            ),
        ));
        tracing::warn!(count = server_paths.len(), "Server-side code markers in archive");
    }

    let license = license::detect(&files);
    let declared_license = hint.as_ref().and_then(|h| h.license.as_ref());
    match (&license, declared_license) {
        (None, None) => warnings.push(AnalysisWarning::new(
            WARN_LICENSE_MISSING,
            "no license file or manifest license found",
        )),
        (Some(DetectedLicense { path, spdx: None }), None) => warnings.push(AnalysisWarning::new(
            WARN_LICENSE_UNRECOGNIZED,
            format!("license in {path} was not recognized"),
        )),
        _ => {}
    }

    let total_size = files.values().map(|b| b.len() as u64).sum();
    tracing::info!(
        files = files.len(),
        total_size,
        entry = %entry,
        runner = %runner,
        "Analyzed archive"
    );

    Ok(ArchiveAnalysis {
        total_size,
        entry,
        entry_candidates,
        runner,
        hint,
        license,
        has_server_code: !server_paths.is_empty(),
        server_paths,
        warnings,
        files,
    })
}

/// Conventional entry points first, then any HTML file (shallowest, then
/// lexicographic).
pub fn entry_candidates(files: &FileMap) -> Vec<String> {
    let mut candidates: Vec<String> = ENTRY_PRIORITY
        .iter()
        .filter(|p| files.contains_key(**p))
        .map(|p| p.to_string())
        .collect();

    let mut html: Vec<&String> = files
        .keys()
        .filter(|p| {
            let lower = p.to_ascii_lowercase();
            lower.ends_with(".html") || lower.ends_with(".htm")
        })
        .filter(|p| !candidates.contains(p))
        .collect();
    html.sort_by_key(|p| (p.matches('/').count(), p.as_str()));
    candidates.extend(html.into_iter().cloned());
    candidates
}

/// Dotfile segments and dependency/VCS/cache directories.
pub fn is_ignored(path: &str) -> bool {
    path.split('/')
        .any(|seg| seg.starts_with('.') || NOISE_DIRS.contains(&seg))
}

fn is_server_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    SERVER_FILE_NAMES.contains(&name)
        || SERVER_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
        || SERVER_DIRS.iter().any(|dir| path.starts_with(dir))
}

fn unsafe_path_warning(path: &str) -> AnalysisWarning {
    tracing::warn!(path = %path, "Skipping archive entry outside the root");
    AnalysisWarning::new(WARN_UNSAFE_PATH, format!("skipped unsafe path {path}"))
}

fn extract_zip(bytes: &[u8], options: &AnalyzeOptions) -> AnalyzeResult<(FileMap, Vec<AnalysisWarning>)> {
    let limits = options.limits;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| AnalyzeError::InvalidArchive(e.to_string()))?;
    if archive.len() > limits.max_entries {
        return Err(AnalyzeError::TooManyEntries {
            limit: limits.max_entries,
        });
    }

    let prefix = options
        .strip_prefix
        .as_deref()
        .map(|p| format!("{}/", p.trim_matches('/')))
        .filter(|p| p != "/");

    let mut files = FileMap::new();
    let mut warnings = Vec::new();
    let mut total: u64 = 0;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| AnalyzeError::InvalidArchive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        if file.unix_mode().is_some_and(|mode| mode & 0o170000 == 0o120000) {
            tracing::debug!(name = file.name(), "Skipping symlink entry");
            continue;
        }

        let raw = file.name().replace('\\', "/");
        let normalized = raw.trim_start_matches("./").to_string();
        if file.enclosed_name().is_none() || !is_safe_relative_path(&normalized) {
            warnings.push(unsafe_path_warning(&raw));
            continue;
        }

        let path = match &prefix {
            Some(p) => match normalized.strip_prefix(p.as_str()) {
                Some(rest) if !rest.is_empty() => rest.to_string(),
                _ => continue,
            },
            None => normalized,
        };
        if is_ignored(&path) {
            continue;
        }

        let mut buf = Vec::new();
        file.by_ref()
            .take(limits.max_file_bytes.saturating_add(1))
            .read_to_end(&mut buf)?;
        let size = buf.len() as u64;
        if size > limits.max_file_bytes {
            return Err(AnalyzeError::FileTooLarge {
                path,
                limit: limits.max_file_bytes,
            });
        }
        total += size;
        if total > limits.max_total_bytes {
            return Err(AnalyzeError::TooLarge {
                limit: limits.max_total_bytes,
            });
        }
        files.insert(path, buf);
    }

    if options.strip_common_root {
        files = strip_common_root(files);
    }
    Ok((files, warnings))
}

/// Remove a first path segment shared by every file.
fn strip_common_root(files: FileMap) -> FileMap {
    let mut roots = files.keys().map(|p| p.split_once('/').map(|(root, _)| root));
    let Some(Some(first)) = roots.next() else {
        return files;
    };
    if !roots.all(|r| r == Some(first)) {
        return files;
    }
    let cut = first.len() + 1;
    files
        .into_iter()
        .map(|(path, bytes)| (path[cut..].to_string(), bytes))
        .collect()
}

/// Encode a file map as a deflated zip.
pub fn write_zip(files: &FileMap) -> AnalyzeResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (path, bytes) in files {
        writer
            .start_file(path.as_str(), options)
            .map_err(|e| AnalyzeError::InvalidArchive(e.to_string()))?;
        writer.write_all(bytes)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| AnalyzeError::InvalidArchive(e.to_string()))?;
    Ok(cursor.into_inner())
}
