//! capsule-state — persistence for the capsule sandbox.
//!
//! - [`StateStore`] is the relational index, backed by
//!   [redb](https://docs.rs/redb): capsules, artifacts, capsule → artifact
//!   links, public references, usage counters and rate-limit buckets.
//! - [`BlobStore`] holds bundle files and uploaded sources.
//! - [`KvStore`] is a best-effort TTL cache in front of the index.
//! - [`ContentStore`] publishes bundles content-addressed across both.
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{capsule_id}:{artifact_id}`, `{owner}:{day}`) enable
//! prefix scans for related records. `StateStore` is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`) and can be shared across async tasks.

pub mod blob;
pub mod cas;
pub mod error;
pub mod kv;
pub mod store;
pub mod tables;
pub mod types;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use cas::{capsule_id, content_hash, ContentStore, PublishOutcome, PublishRequest};
pub use error::{StateError, StateResult};
pub use kv::{KvStore, MemoryKv};
pub use store::StateStore;
pub use types::*;
