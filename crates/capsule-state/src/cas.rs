//! Content-addressed publishing.
//!
//! The content hash covers the canonical manifest and every file, walked in
//! path order with length prefixes, so equal bundles hash equally however
//! their files were collected. The capsule id is a fixed-length prefix of
//! that hash.
//!
//! Publishing writes blobs first and the index row last: a crash in
//! between leaves unreferenced blobs, never a row pointing at missing
//! bytes.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use capsule_core::{unix_now, FileMap, Manifest, Quarantine, UserId};

use crate::blob::BlobStore;
use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::CapsuleRecord;

/// Hex characters of the hash used as the capsule id.
pub const CAPSULE_ID_LEN: usize = 16;

const HASH_DOMAIN: &[u8] = b"capsule-bundle-v1\0";

/// Order-independent hash over manifest and files.
pub fn content_hash(manifest: &Manifest, files: &FileMap) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HASH_DOMAIN);
    let manifest_bytes = manifest.canonical_bytes();
    hasher.update((manifest_bytes.len() as u64).to_le_bytes());
    hasher.update(&manifest_bytes);
    // FileMap is ordered by path.
    for (path, bytes) in files {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

/// Capsule id for a content hash.
pub fn capsule_id(hash: &str) -> String {
    hash.chars().take(CAPSULE_ID_LEN).collect()
}

/// Id used when the plain id already belongs to another owner.
fn owner_scoped_id(hash: &str, owner: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update(b":");
    hasher.update(owner.as_bytes());
    capsule_id(&hex::encode(hasher.finalize()))
}

/// Blob key of one bundle file.
pub fn blob_key(hash: &str, path: &str) -> String {
    format!("capsules/{hash}/{path}")
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub owner: UserId,
    pub manifest: Manifest,
    pub files: FileMap,
    pub modules: Vec<String>,
    pub warnings: Vec<String>,
    pub quarantine: Option<Quarantine>,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub capsule: CapsuleRecord,
    /// True when an identical bundle from the same owner already existed.
    pub deduplicated: bool,
}

/// Index store plus blob store, published through together.
#[derive(Clone)]
pub struct ContentStore {
    index: StateStore,
    blobs: Arc<dyn BlobStore>,
}

impl ContentStore {
    pub fn new(index: StateStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self { index, blobs }
    }

    pub fn index(&self) -> &StateStore {
        &self.index
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Publish a bundle. Identical content from the same owner resolves to
    /// the existing capsule.
    pub async fn publish(&self, request: PublishRequest) -> StateResult<PublishOutcome> {
        let hash = content_hash(&request.manifest, &request.files);

        let mut id = capsule_id(&hash);
        if let Some(existing) = self.index.get_capsule(&id)? {
            if existing.hash == hash && existing.owner == request.owner {
                debug!(%id, "identical bundle already published");
                return Ok(PublishOutcome {
                    capsule: existing,
                    deduplicated: true,
                });
            }
            id = owner_scoped_id(&hash, &request.owner);
            if let Some(existing) = self.index.get_capsule(&id)? {
                if existing.hash == hash && existing.owner == request.owner {
                    return Ok(PublishOutcome {
                        capsule: existing,
                        deduplicated: true,
                    });
                }
                return Err(StateError::Conflict(format!("capsule id {id} already taken")));
            }
        }

        for (path, bytes) in &request.files {
            let key = blob_key(&hash, path);
            if !self.blobs.exists(&key).await? {
                self.blobs.put(&key, bytes).await?;
            }
        }

        let size = request.manifest.bundle_size;
        let record = CapsuleRecord {
            id: id.clone(),
            owner: request.owner,
            hash,
            manifest: request.manifest,
            modules: request.modules,
            warnings: request.warnings,
            quarantine: request.quarantine,
            created_at: unix_now(),
        };
        if !self.index.insert_capsule(&record)? {
            // A concurrent publish of the same bundle won the insert.
            return match self.index.get_capsule(&id)? {
                Some(existing) if existing.hash == record.hash && existing.owner == record.owner => {
                    Ok(PublishOutcome {
                        capsule: existing,
                        deduplicated: true,
                    })
                }
                _ => Err(StateError::Conflict(format!("capsule id {id} already taken"))),
            };
        }
        self.index.add_storage(&record.owner, size)?;

        info!(
            id = %record.id,
            owner = %record.owner,
            files = record.manifest.assets.len(),
            size,
            quarantined = record.is_quarantined(),
            "capsule published"
        );
        Ok(PublishOutcome {
            capsule: record,
            deduplicated: false,
        })
    }

    /// Read one bundle file of a capsule.
    pub async fn read_file(&self, capsule: &CapsuleRecord, path: &str) -> StateResult<Option<Vec<u8>>> {
        if !capsule.manifest.assets.iter().any(|a| a.path == path) {
            return Ok(None);
        }
        self.blobs.get(&blob_key(&capsule.hash, path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use capsule_core::{GenerateInput, QuarantineSource, RunnerType};

    fn bundle(entries: &[(&str, &str)]) -> (Manifest, FileMap) {
        let files: FileMap = entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect();
        let manifest = Manifest::generate(
            None,
            GenerateInput {
                runner: RunnerType::ClientStatic,
                entry: "index.html",
                files: &files,
                detected_license: None,
            },
        )
        .unwrap();
        (manifest, files)
    }

    fn request(owner: &str, manifest: Manifest, files: FileMap) -> PublishRequest {
        PublishRequest {
            owner: owner.into(),
            manifest,
            files,
            modules: vec![],
            warnings: vec![],
            quarantine: None,
        }
    }

    fn content_store() -> (ContentStore, MemoryBlobStore) {
        let blobs = MemoryBlobStore::new();
        let store = ContentStore::new(StateStore::open_in_memory().unwrap(), Arc::new(blobs.clone()));
        (store, blobs)
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let (m1, f1) = bundle(&[("index.html", "a"), ("js/app.js", "b")]);
        let (m2, f2) = bundle(&[("js/app.js", "b"), ("index.html", "a")]);
        assert_eq!(content_hash(&m1, &f1), content_hash(&m2, &f2));
    }

    #[test]
    fn hash_is_sensitive_to_path_boundaries() {
        let (m1, f1) = bundle(&[("index.html", "ab")]);
        let (m2, mut f2) = bundle(&[("index.html", "ab")]);
        f2.insert("index.htmlab".into(), Vec::new());
        assert_ne!(content_hash(&m1, &f1), content_hash(&m2, &f2));
    }

    #[test]
    fn id_is_hash_prefix() {
        let (m, f) = bundle(&[("index.html", "a")]);
        let hash = content_hash(&m, &f);
        assert_eq!(hash.len(), 64);
        assert_eq!(capsule_id(&hash), &hash[..CAPSULE_ID_LEN]);
    }

    #[tokio::test]
    async fn publish_writes_blobs_then_row() {
        let (store, blobs) = content_store();
        let (m, f) = bundle(&[("index.html", "a"), ("js/app.js", "b")]);
        let outcome = store.publish(request("alice", m, f)).await.unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(blobs.len(), 2);
        assert_eq!(store.index().storage_used("alice").unwrap(), 2);

        let capsule = store.index().get_capsule(&outcome.capsule.id).unwrap().unwrap();
        assert_eq!(
            store.read_file(&capsule, "js/app.js").await.unwrap(),
            Some(b"b".to_vec())
        );
        assert_eq!(store.read_file(&capsule, "missing.js").await.unwrap(), None);
    }

    #[tokio::test]
    async fn identical_content_dedupes_per_owner() {
        let (store, blobs) = content_store();
        let (m, f) = bundle(&[("index.html", "a")]);

        let first = store.publish(request("alice", m.clone(), f.clone())).await.unwrap();
        let again = store.publish(request("alice", m.clone(), f.clone())).await.unwrap();
        assert!(again.deduplicated);
        assert_eq!(first.capsule.id, again.capsule.id);
        assert_eq!(store.index().storage_used("alice").unwrap(), 1);

        let other = store.publish(request("bob", m, f)).await.unwrap();
        assert!(!other.deduplicated);
        assert_ne!(other.capsule.id, first.capsule.id);
        assert_eq!(other.capsule.owner, "bob");
        assert_eq!(other.capsule.hash, first.capsule.hash);
        // Blob bytes are shared by hash.
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn quarantine_is_recorded_at_persist() {
        let (store, _) = content_store();
        let (m, f) = bundle(&[("index.html", "a")]);
        let mut req = request("alice", m, f);
        req.quarantine = Some(Quarantine {
            reason: "crypto_miner".into(),
            source: QuarantineSource::Scanner,
            quarantined_at: 1,
        });
        let outcome = store.publish(req).await.unwrap();
        assert!(outcome.capsule.is_quarantined());
    }
}
