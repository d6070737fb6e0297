//! Shared types used across capsule crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Path → bytes map of a bundle. Ordered so every walk over it is deterministic.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Owner / viewer identifier (the verified token subject).
pub type UserId = String;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Execution environment a bundle targets. The tier decides trust level,
/// permitted imports, and capability defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerType {
    /// Static HTML/JS executed in a sandboxed browser iframe.
    ClientStatic,
    /// A compiled UI component mounted by the host page.
    ReactComponent,
    /// VM-grade runner; isolation is enforced by the hosting runtime.
    Webcontainer,
}

/// How much the runner itself is trusted to contain the code it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Sandboxed,
    Compiled,
    VirtualMachine,
}

/// Which bare module specifiers a tier may import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAllowance {
    /// Only the listed package names.
    Listed(&'static [&'static str]),
    /// Anything; the sandbox boundary lives elsewhere.
    Any,
}

impl ModuleAllowance {
    pub fn permits(&self, package: &str) -> bool {
        match self {
            ModuleAllowance::Listed(names) => names.contains(&package),
            ModuleAllowance::Any => true,
        }
    }
}

/// Static policy attached to a runner tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub trust: TrustTier,
    pub modules: ModuleAllowance,
    /// Whether `https://…` specifiers are acceptable imports.
    pub url_imports: bool,
    pub default_storage: bool,
    pub default_workers: bool,
}

const STATIC_MODULES: &[&str] = &[
    "three",
    "d3",
    "lodash-es",
    "p5",
    "tone",
    "chart.js",
    "canvas-confetti",
    "gsap",
];

const COMPONENT_MODULES: &[&str] = &[
    "react",
    "react-dom",
    "three",
    "d3",
    "lodash",
    "lodash-es",
    "framer-motion",
    "zustand",
    "@react-three/fiber",
    "@react-three/drei",
    "recharts",
    "clsx",
    "tone",
    "canvas-confetti",
];

static CLIENT_STATIC_POLICY: TierPolicy = TierPolicy {
    trust: TrustTier::Sandboxed,
    modules: ModuleAllowance::Listed(STATIC_MODULES),
    url_imports: false,
    default_storage: false,
    default_workers: false,
};

static REACT_COMPONENT_POLICY: TierPolicy = TierPolicy {
    trust: TrustTier::Compiled,
    modules: ModuleAllowance::Listed(COMPONENT_MODULES),
    url_imports: false,
    default_storage: true,
    default_workers: false,
};

static WEBCONTAINER_POLICY: TierPolicy = TierPolicy {
    trust: TrustTier::VirtualMachine,
    modules: ModuleAllowance::Any,
    url_imports: true,
    default_storage: true,
    default_workers: true,
};

impl RunnerType {
    pub const ALL: [RunnerType; 3] = [
        RunnerType::ClientStatic,
        RunnerType::ReactComponent,
        RunnerType::Webcontainer,
    ];

    /// Tier → policy lookup. Adding a runner forces a new arm here.
    pub fn policy(&self) -> &'static TierPolicy {
        match self {
            RunnerType::ClientStatic => &CLIENT_STATIC_POLICY,
            RunnerType::ReactComponent => &REACT_COMPONENT_POLICY,
            RunnerType::Webcontainer => &WEBCONTAINER_POLICY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::ClientStatic => "client-static",
            RunnerType::ReactComponent => "react-component",
            RunnerType::Webcontainer => "webcontainer",
        }
    }

    /// Best guess when no manifest declares a runner.
    pub fn infer_from_entry(entry: &str) -> Self {
        let lower = entry.to_ascii_lowercase();
        if lower.ends_with(".jsx") || lower.ends_with(".tsx") {
            RunnerType::ReactComponent
        } else {
            RunnerType::ClientStatic
        }
    }
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunnerType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown runner type: {s}"))
    }
}

/// Lifecycle of an artifact's bundle bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Active,
    Failed,
}

/// Moderation status of an artifact, independent of its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Active,
    Quarantined,
}

impl PolicyStatus {
    pub fn is_blocking(&self) -> bool {
        matches!(self, PolicyStatus::Quarantined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Unlisted,
    Public,
}

/// Who placed a quarantine flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineSource {
    Scanner,
    Moderator,
}

/// Quarantine metadata. Additive: rows are never deleted because of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quarantine {
    pub reason: String,
    pub source: QuarantineSource,
    pub quarantined_at: u64,
}

/// True for a normalized relative path that stays inside the bundle root.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !path.contains('\0')
        && path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Validate an artifact runtime version string (semver).
pub fn parse_runtime_version(raw: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(raw.trim().trim_start_matches('v'))
}
