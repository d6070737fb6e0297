pub mod allowlist;
pub mod config;
pub mod manifest;
pub mod plan;
pub mod types;

pub use allowlist::{Allowlist, AllowlistRule, RuleError, DEFAULT_PORTS};
pub use config::CapsuleConfig;
pub use manifest::{
    AssetSummary, Capabilities, GenerateInput, Manifest, ManifestError, ManifestHint, ParamSpec, MANIFEST_VERSION,
};
pub use plan::{PlanLimits, PlanTier};
pub use types::*;
