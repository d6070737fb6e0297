//! redb table definitions for the capsule index.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Composite keys are `{parent}:{child}` so related rows share a scan prefix.

use redb::TableDefinition;

/// Capsule rows keyed by `{capsule_id}`.
pub const CAPSULES: TableDefinition<&str, &[u8]> = TableDefinition::new("capsules");

/// Artifact rows keyed by `{artifact_id}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Capsule → derived artifact links keyed by `{capsule_id}:{artifact_id}`.
pub const ARTIFACT_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("artifact_index");

/// Public references (posts) keyed by `{capsule_id}:{post_id}`.
pub const REFERENCES: TableDefinition<&str, &[u8]> = TableDefinition::new("references");

/// Daily build counters keyed by `{owner}:{day}`.
pub const BUILD_USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("build_usage");

/// Stored bytes per owner keyed by `{owner}`.
pub const STORAGE_USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("storage_usage");

/// Rate-limit buckets keyed by `{scope}:{identity}`.
pub const RATE_LIMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("rate_limits");
