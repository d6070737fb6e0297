//! StateStore — redb-backed relational index for capsules.
//!
//! Provides typed operations over capsules, artifacts, public references,
//! usage counters and rate-limit buckets. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use capsule_core::Quarantine;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            CAPSULES,
            ARTIFACTS,
            ARTIFACT_INDEX,
            REFERENCES,
            BUILD_USAGE,
            STORAGE_USAGE,
            RATE_LIMITS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read-modify-write of one row inside a single write transaction.
    /// An `Err` from `f` aborts the transaction.
    fn update_json<T, F>(&self, def: JsonTable, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let next = f(current)?;
            let bytes = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    fn scan_prefix<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    // ── Capsules ───────────────────────────────────────────────────

    /// Insert a capsule row unless the id is taken. Returns false (and
    /// writes nothing) when a row already exists.
    pub fn insert_capsule(&self, record: &CapsuleRecord) -> StateResult<bool> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted = {
            let mut table = txn.open_table(CAPSULES).map_err(map_err!(Table))?;
            let exists = table
                .get(record.id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(record.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            !exists
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %record.id, inserted, "capsule row written");
        Ok(inserted)
    }

    pub fn get_capsule(&self, id: &str) -> StateResult<Option<CapsuleRecord>> {
        self.get_json(CAPSULES, id)
    }

    pub fn list_capsules_for_owner(&self, owner: &str) -> StateResult<Vec<CapsuleRecord>> {
        let all: Vec<CapsuleRecord> = self.scan_prefix(CAPSULES, "")?;
        Ok(all.into_iter().filter(|c| c.owner == owner).collect())
    }

    /// Set or clear quarantine metadata. The row itself is never removed.
    pub fn set_capsule_quarantine(
        &self,
        id: &str,
        quarantine: Option<Quarantine>,
    ) -> StateResult<CapsuleRecord> {
        self.update_json(CAPSULES, id, |current: Option<CapsuleRecord>| {
            let mut record = current.ok_or_else(|| StateError::NotFound(format!("capsule {id}")))?;
            record.quarantine = quarantine;
            Ok(record)
        })
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Insert or replace an artifact row.
    pub fn put_artifact(&self, record: &ArtifactRecord) -> StateResult<()> {
        self.put_json(ARTIFACTS, &record.id, record)?;
        debug!(id = %record.id, status = ?record.status, "artifact stored");
        Ok(())
    }

    pub fn get_artifact(&self, id: &str) -> StateResult<Option<ArtifactRecord>> {
        self.get_json(ARTIFACTS, id)
    }

    /// Mutate an artifact in one transaction, keeping its capsule link row
    /// in step with its policy status.
    pub fn update_artifact<F>(&self, id: &str, f: F) -> StateResult<ArtifactRecord>
    where
        F: FnOnce(&mut ArtifactRecord) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut artifacts = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
            let mut record: ArtifactRecord = match artifacts.get(id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("artifact {id}"))),
            };
            f(&mut record)?;
            record.updated_at = capsule_core::unix_now();
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            artifacts
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;

            if let Some(capsule_id) = &record.capsule_id {
                let link = ArtifactLink {
                    artifact_id: record.id.clone(),
                    policy: record.policy,
                };
                let link_bytes = serde_json::to_vec(&link).map_err(map_err!(Serialize))?;
                let mut index = txn.open_table(ARTIFACT_INDEX).map_err(map_err!(Table))?;
                index
                    .insert(format!("{capsule_id}:{id}").as_str(), link_bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, status = ?record.status, policy = ?record.policy, "artifact updated");
        Ok(record)
    }

    /// Artifacts derived from a capsule, with their policy status.
    pub fn artifacts_for_capsule(&self, capsule_id: &str) -> StateResult<Vec<ArtifactLink>> {
        self.scan_prefix(ARTIFACT_INDEX, &format!("{capsule_id}:"))
    }

    // ── References ─────────────────────────────────────────────────

    pub fn put_reference(&self, reference: &PostReference) -> StateResult<()> {
        self.put_json(REFERENCES, &reference.table_key(), reference)
    }

    pub fn references_for_capsule(&self, capsule_id: &str) -> StateResult<Vec<PostReference>> {
        self.scan_prefix(REFERENCES, &format!("{capsule_id}:"))
    }

    // ── Usage ──────────────────────────────────────────────────────

    /// Builds recorded for `owner` on `day` (see [`day_index`]).
    pub fn builds_on(&self, owner: &str, day: u64) -> StateResult<u32> {
        Ok(self
            .get_json(BUILD_USAGE, &format!("{owner}:{day}"))?
            .unwrap_or(0))
    }

    /// Increment and return the build counter for `owner` on `day`.
    pub fn record_build(&self, owner: &str, day: u64) -> StateResult<u32> {
        self.update_json(BUILD_USAGE, &format!("{owner}:{day}"), |n: Option<u32>| {
            Ok(n.unwrap_or(0).saturating_add(1))
        })
    }

    pub fn storage_used(&self, owner: &str) -> StateResult<u64> {
        Ok(self.get_json(STORAGE_USAGE, owner)?.unwrap_or(0))
    }

    /// Add `bytes` to an owner's stored total and return the new total.
    pub fn add_storage(&self, owner: &str, bytes: u64) -> StateResult<u64> {
        self.update_json(STORAGE_USAGE, owner, |n: Option<u64>| {
            Ok(n.unwrap_or(0).saturating_add(bytes))
        })
    }

    // ── Rate limits ────────────────────────────────────────────────

    pub fn get_rate_limit(&self, key: &str) -> StateResult<Option<RateLimitBucket>> {
        self.get_json(RATE_LIMITS, key)
    }

    /// Atomically replace a bucket with `f(current)`.
    pub fn update_rate_limit<F>(&self, key: &str, f: F) -> StateResult<RateLimitBucket>
    where
        F: FnOnce(Option<RateLimitBucket>) -> RateLimitBucket,
    {
        self.update_json(RATE_LIMITS, key, |current| Ok(f(current)))
    }

    /// Drop buckets whose window has ended. Returns the number removed.
    pub fn purge_expired_rate_limits(&self, now_ms: u64) -> StateResult<usize> {
        let expired: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(RATE_LIMITS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let bucket: RateLimitBucket =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if bucket.is_expired(now_ms) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RATE_LIMITS).map_err(map_err!(Table))?;
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed = expired.len(), "expired rate-limit buckets purged");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::{
        ArtifactStatus, GenerateInput, Manifest, PlanTier, PolicyStatus, QuarantineSource, RunnerType,
        Visibility, FileMap,
    };

    fn test_capsule(id: &str, owner: &str) -> CapsuleRecord {
        let mut files = FileMap::new();
        files.insert("index.html".into(), b"<p>hi</p>".to_vec());
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
        CapsuleRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            hash: format!("{id}ffff"),
            manifest,
            modules: vec![],
            warnings: vec![],
            quarantine: None,
            created_at: 1000,
        }
    }

    fn test_artifact(id: &str, owner: &str) -> ArtifactRecord {
        ArtifactRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            plan: PlanTier::Free,
            capsule_id: None,
            runner: RunnerType::ReactComponent,
            runtime_version: "1.0.0".to_string(),
            bundle_digest: None,
            status: ArtifactStatus::Draft,
            policy: PolicyStatus::Active,
            visibility: Visibility::Private,
            declared_size: 10,
            source_key: None,
            quarantine: None,
            error: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Capsules ───────────────────────────────────────────────────

    #[test]
    fn capsule_insert_is_first_writer_wins() {
        let store = StateStore::open_in_memory().unwrap();
        let first = test_capsule("abc", "alice");
        assert!(store.insert_capsule(&first).unwrap());

        let second = test_capsule("abc", "bob");
        assert!(!store.insert_capsule(&second).unwrap());
        assert_eq!(store.get_capsule("abc").unwrap().unwrap().owner, "alice");
    }

    #[test]
    fn capsule_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_capsule("nope").unwrap().is_none());
    }

    #[test]
    fn quarantine_is_metadata_on_the_row() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_capsule(&test_capsule("abc", "alice")).unwrap();

        let q = Quarantine {
            reason: "miner".into(),
            source: QuarantineSource::Scanner,
            quarantined_at: 5,
        };
        let updated = store.set_capsule_quarantine("abc", Some(q.clone())).unwrap();
        assert_eq!(updated.quarantine, Some(q));
        assert!(store.get_capsule("abc").unwrap().unwrap().is_quarantined());

        store.set_capsule_quarantine("abc", None).unwrap();
        assert!(!store.get_capsule("abc").unwrap().unwrap().is_quarantined());

        assert!(matches!(
            store.set_capsule_quarantine("missing", None),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn list_capsules_by_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_capsule(&test_capsule("a1", "alice")).unwrap();
        store.insert_capsule(&test_capsule("a2", "alice")).unwrap();
        store.insert_capsule(&test_capsule("b1", "bob")).unwrap();
        assert_eq!(store.list_capsules_for_owner("alice").unwrap().len(), 2);
    }

    // ── Artifacts ──────────────────────────────────────────────────

    #[test]
    fn artifact_update_maintains_capsule_link() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_artifact(&test_artifact("art-1", "alice")).unwrap();
        assert!(store.artifacts_for_capsule("cap").unwrap().is_empty());

        store
            .update_artifact("art-1", |a| {
                a.capsule_id = Some("cap".into());
                a.status = ArtifactStatus::Active;
                Ok(())
            })
            .unwrap();
        let links = store.artifacts_for_capsule("cap").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].policy, PolicyStatus::Active);

        store
            .update_artifact("art-1", |a| {
                a.policy = PolicyStatus::Quarantined;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.artifacts_for_capsule("cap").unwrap()[0].policy,
            PolicyStatus::Quarantined
        );
    }

    #[test]
    fn artifact_update_error_aborts() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_artifact(&test_artifact("art-1", "alice")).unwrap();
        let result = store.update_artifact("art-1", |a| {
            a.status = ArtifactStatus::Active;
            Err(StateError::Conflict("no".into()))
        });
        assert!(result.is_err());
        assert_eq!(
            store.get_artifact("art-1").unwrap().unwrap().status,
            ArtifactStatus::Draft
        );
        assert!(matches!(
            store.update_artifact("missing", |_| Ok(())),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn artifact_links_are_scoped_by_capsule() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, cap) in [("a", "cap1"), ("b", "cap1"), ("c", "cap10")] {
            let mut art = test_artifact(id, "alice");
            art.capsule_id = Some(cap.into());
            store.put_artifact(&art).unwrap();
            store.update_artifact(id, |_| Ok(())).unwrap();
        }
        assert_eq!(store.artifacts_for_capsule("cap1").unwrap().len(), 2);
    }

    // ── References ─────────────────────────────────────────────────

    #[test]
    fn references_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let reference = PostReference {
            capsule_id: "cap".into(),
            post_id: "post-1".into(),
            owner: "alice".into(),
            visibility: Visibility::Public,
            quarantined: false,
            created_at: 1,
        };
        store.put_reference(&reference).unwrap();
        let refs = store.references_for_capsule("cap").unwrap();
        assert_eq!(refs, vec![reference]);
        assert!(refs[0].is_public());
    }

    // ── Usage ──────────────────────────────────────────────────────

    #[test]
    fn build_counter_is_per_day() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.builds_on("alice", 100).unwrap(), 0);
        assert_eq!(store.record_build("alice", 100).unwrap(), 1);
        assert_eq!(store.record_build("alice", 100).unwrap(), 2);
        assert_eq!(store.builds_on("alice", 101).unwrap(), 0);
        assert_eq!(store.builds_on("bob", 100).unwrap(), 0);
    }

    #[test]
    fn storage_accumulates() {
        let store = StateStore::open_in_memory().unwrap();
        store.add_storage("alice", 10).unwrap();
        assert_eq!(store.add_storage("alice", 5).unwrap(), 15);
        assert_eq!(store.storage_used("alice").unwrap(), 15);
    }

    // ── Rate limits ────────────────────────────────────────────────

    #[test]
    fn rate_limit_update_and_purge() {
        let store = StateStore::open_in_memory().unwrap();
        let bucket = store
            .update_rate_limit("proxy:alice", |current| {
                assert!(current.is_none());
                RateLimitBucket { count: 1, reset_at_ms: 1000 }
            })
            .unwrap();
        assert_eq!(bucket.count, 1);
        store
            .update_rate_limit("proxy:bob", |_| RateLimitBucket { count: 1, reset_at_ms: 5000 })
            .unwrap();

        assert_eq!(store.purge_expired_rate_limits(2000).unwrap(), 1);
        assert!(store.get_rate_limit("proxy:alice").unwrap().is_none());
        assert!(store.get_rate_limit("proxy:bob").unwrap().is_some());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("capsule.redb");
        {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_capsule(&test_capsule("abc", "alice")).unwrap();
        }
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_capsule("abc").unwrap().unwrap().owner, "alice");
    }
}
