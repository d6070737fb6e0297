//! Blob storage for bundle files and uploaded sources.
//!
//! Keys are `/`-separated relative paths (`capsules/{hash}/{path}`,
//! `sources/{artifact_id}.zip`). The filesystem store refuses keys that
//! would escape its root.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

use capsule_core::is_safe_relative_path;

use crate::error::{StateError, StateResult};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()>;

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> StateResult<bool>;

    async fn delete(&self, key: &str) -> StateResult<bool>;
}

/// Blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StateResult<PathBuf> {
        if !is_safe_relative_path(key) {
            return Err(StateError::Blob(format!("invalid blob key {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::Blob(e.to_string()))?;
        }
        // Readers never see a partial blob.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StateError::Blob(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateError::Blob(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Blob(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StateError::Blob(e.to_string()))
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::Blob(e.to_string())),
        }
    }
}

/// In-memory blob store (for testing).
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        Ok(self.blobs.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        Ok(self.blobs.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("capsules/abc/index.html", b"<p>").await.unwrap();
        assert!(store.exists("capsules/abc/index.html").await.unwrap());
        assert_eq!(
            store.get("capsules/abc/index.html").await.unwrap(),
            Some(b"<p>".to_vec())
        );
        assert!(store.delete("capsules/abc/index.html").await.unwrap());
        assert_eq!(store.get("capsules/abc/index.html").await.unwrap(), None);
        assert!(!store.delete("capsules/abc/index.html").await.unwrap());
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store.put("k", b"v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
