//! capsule.toml configuration parser.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::allowlist::{Allowlist, RuleError};
use crate::plan::{PlanLimits, PlanTier};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid egress allowlist: {0}")]
    Allowlist(#[from] RuleError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CapsuleConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub egress: EgressConfig,
    pub bundler: BundlerConfig,
    pub archive: ArchiveConfig,
    pub import: ImportConfig,
    pub rate_limit: RateLimitConfig,
    /// Per-tier overrides keyed by plan name (`free`, `pro`, `team`).
    pub plans: HashMap<String, PlanLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: String,
    /// Hard ceiling on any request body.
    pub max_upload_bytes: u64,
    /// Whole-pipeline deadline for a single build.
    pub build_timeout_secs: u64,
    /// Base URL used when turning external module names into an import map.
    pub import_map_cdn: String,
    /// Capacity of the artifact compile queue.
    pub compile_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            data_dir: "/var/lib/capsule".to_string(),
            max_upload_bytes: 64 * 1024 * 1024,
            build_timeout_secs: 120,
            import_map_cdn: "https://esm.sh".to_string(),
            compile_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub issuer: String,
    /// Accepted audiences. Empty means audience is not checked.
    pub audiences: Vec<String>,
    /// Key set location; defaults to `{issuer}/.well-known/jwks.json`.
    pub jwks_url: Option<String>,
    pub jwks_ttl_secs: u64,
    pub clock_skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audiences: Vec::new(),
            jwks_url: None,
            jwks_ttl_secs: 600,
            clock_skew_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Deployment-wide ceiling; a capsule never reaches hosts outside it.
    pub allowlist: Vec<String>,
    pub per_ip_per_minute: u32,
    pub timeout_secs: u64,
    pub max_response_bytes: u64,
    pub user_agent: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            per_ip_per_minute: 120,
            timeout_secs: 15,
            max_response_bytes: 10 * 1024 * 1024,
            user_agent: "capsule-egress/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// External bundler executable. Unset means files pass through unchanged.
    pub program: Option<String>,
    /// Arguments; `{src}`, `{out}`, `{entry}` and `{runner}` are substituted.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Fall back to raw files (logged, with a warning) when the bundler fails.
    pub allow_degraded: bool,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_secs: 60,
            allow_degraded: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub max_entries: usize,
    pub max_total_bytes: u64,
    pub max_file_bytes: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_bytes: 200 * 1024 * 1024,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub github_codeload_base: String,
    pub download_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            github_codeload_base: "https://codeload.github.com".to_string(),
            download_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub shards: usize,
    pub shard_timeout_ms: u64,
    pub relational: bool,
    pub kv_cache: bool,
    pub in_process: bool,
    pub in_process_max_entries: usize,
    pub public_read_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            shard_timeout_ms: 50,
            relational: true,
            kv_cache: true,
            in_process: true,
            in_process_max_entries: 10_000,
            public_read_per_minute: 300,
        }
    }
}

impl CapsuleConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: CapsuleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.egress_allowlist()?;
        for name in self.plans.keys() {
            name.parse::<PlanTier>().map_err(ConfigError::Invalid)?;
        }
        if self.rate_limit.shards == 0 {
            return Err(ConfigError::Invalid("rate_limit.shards must be at least 1".into()));
        }
        Ok(())
    }

    /// Parsed deployment-wide egress allowlist.
    pub fn egress_allowlist(&self) -> Result<Allowlist, RuleError> {
        Allowlist::parse_all(&self.egress.allowlist)
    }

    /// Limits for a plan, falling back to built-in defaults.
    pub fn limits_for(&self, plan: PlanTier) -> PlanLimits {
        self.plans
            .get(plan.as_str())
            .copied()
            .unwrap_or_else(|| plan.default_limits())
    }

    /// Where the key set for the configured issuer lives.
    pub fn jwks_url(&self) -> String {
        self.auth.jwks_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/jwks.json",
                self.auth.issuer.trim_end_matches('/')
            )
        })
    }
}
