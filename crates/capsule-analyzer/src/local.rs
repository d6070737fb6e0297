//! Read a project directory from disk into a [`FileMap`].

use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use capsule_core::config::ArchiveConfig;
use capsule_core::FileMap;

use crate::archive::is_ignored;
use crate::error::{AnalyzeError, AnalyzeResult};

/// Walk `root`, skipping noise directories and symlinks, with the same size
/// and count limits as archive extraction.
pub fn read_dir(root: &Path, limits: &ArchiveConfig) -> AnalyzeResult<FileMap> {
    let mut files = FileMap::new();
    let mut total: u64 = 0;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !is_ignored(&e.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = entry.map_err(|e| AnalyzeError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative.to_string_lossy().replace('\\', "/");

        if files.len() >= limits.max_entries {
            return Err(AnalyzeError::TooManyEntries {
                limit: limits.max_entries,
            });
        }
        let mut buf = Vec::new();
        std::fs::File::open(entry.path())?
            .take(limits.max_file_bytes.saturating_add(1))
            .read_to_end(&mut buf)?;
        if buf.len() as u64 > limits.max_file_bytes {
            return Err(AnalyzeError::FileTooLarge {
                path,
                limit: limits.max_file_bytes,
            });
        }
        total += buf.len() as u64;
        if total > limits.max_total_bytes {
            return Err(AnalyzeError::TooLarge {
                limit: limits.max_total_bytes,
            });
        }
        files.insert(path, buf);
    }

    tracing::debug!(root = %root.display(), files = files.len(), "Read project directory");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_tree_without_noise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>").unwrap();
        std::fs::write(dir.path().join("src/app.js"), "run()").unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let files = read_dir(dir.path(), &ArchiveConfig::default()).unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["index.html", "src/app.js"]);
    }

    #[test]
    fn enforces_file_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.js"), vec![b'a'; 2048]).unwrap();
        let limits = ArchiveConfig {
            max_file_bytes: 1024,
            ..Default::default()
        };
        assert!(matches!(
            read_dir(dir.path(), &limits),
            Err(AnalyzeError::FileTooLarge { .. })
        ));
    }
}
