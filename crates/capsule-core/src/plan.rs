//! Plan tiers and their quota limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Team,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Team => "team",
        }
    }

    /// Built-in limits, used for any tier missing from `[plans]`.
    pub fn default_limits(&self) -> PlanLimits {
        const MIB: u64 = 1024 * 1024;
        match self {
            PlanTier::Free => PlanLimits {
                max_bundle_bytes: 10 * MIB,
                max_storage_bytes: 100 * MIB,
                builds_per_day: 20,
                proxy_per_minute: 60,
            },
            PlanTier::Pro => PlanLimits {
                max_bundle_bytes: 50 * MIB,
                max_storage_bytes: 2048 * MIB,
                builds_per_day: 200,
                proxy_per_minute: 600,
            },
            PlanTier::Team => PlanLimits {
                max_bundle_bytes: 100 * MIB,
                max_storage_bytes: 10240 * MIB,
                builds_per_day: 1000,
                proxy_per_minute: 1200,
            },
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            "team" => Ok(PlanTier::Team),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

/// Quota ceilings for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Largest single bundle (sum of retained file sizes).
    pub max_bundle_bytes: u64,
    /// Total bytes across an owner's capsules and artifact sources.
    pub max_storage_bytes: u64,
    pub builds_per_day: u32,
    pub proxy_per_minute: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plans() {
        assert_eq!("Pro".parse::<PlanTier>().unwrap(), PlanTier::Pro);
        assert!("enterprise".parse::<PlanTier>().is_err());
    }

    #[test]
    fn higher_tiers_have_higher_limits() {
        let free = PlanTier::Free.default_limits();
        let team = PlanTier::Team.default_limits();
        assert!(team.max_bundle_bytes > free.max_bundle_bytes);
        assert!(team.proxy_per_minute > free.proxy_per_minute);
    }
}
