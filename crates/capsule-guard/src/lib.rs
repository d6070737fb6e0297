//! capsule-guard — policy enforcement around stored bundles.
//!
//! - [`scan`] checks a bundle and its manifest against fixed safety rules.
//!   A hit never aborts a build; it becomes quarantine metadata on the
//!   persisted record.
//! - [`access`] decides, as a pure function, whether a viewer may see a
//!   capsule or artifact. Every denial has the same shape.

pub mod access;
pub mod scan;

pub use access::{
    moderation_info, resolve_artifact, resolve_capsule, AccessDecision, AccessReason,
    ModerationInfo, ModerationState, Viewer,
};
pub use scan::{scan_bundle, SafetyHit, ScanReport};
