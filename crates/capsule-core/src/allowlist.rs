//! Egress allowlist rules.
//!
//! A rule is `host`, `host:port`, `*.suffix` or `*.suffix:port`. A leading
//! `http://` / `https://` and a trailing `/` are tolerated and dropped.
//! Rules without a port permit [`DEFAULT_PORTS`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Ports permitted when a rule does not name one.
pub const DEFAULT_PORTS: [u16; 2] = [80, 443];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("empty allowlist entry")]
    Empty,
    #[error("invalid port in allowlist entry: {0}")]
    InvalidPort(String),
    #[error("invalid hostname in allowlist entry: {0}")]
    InvalidHost(String),
    #[error("wildcard too broad: {0}")]
    WildcardTooBroad(String),
}

/// One permitted egress target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowlistRule {
    /// Lowercased hostname; for wildcards, the suffix after `*.`.
    pub host: String,
    pub port: Option<u16>,
    pub wildcard: bool,
}

impl AllowlistRule {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let mut s = raw.trim().to_ascii_lowercase();
        for scheme in ["https://", "http://"] {
            if let Some(rest) = s.strip_prefix(scheme) {
                s = rest.to_string();
            }
        }
        let s = s.trim_end_matches('/');
        if s.is_empty() {
            return Err(RuleError::Empty);
        }

        let (host_part, port) = match s.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| RuleError::InvalidPort(raw.to_string()))?;
                if port == 0 {
                    return Err(RuleError::InvalidPort(raw.to_string()));
                }
                (h, Some(port))
            }
            None => (s, None),
        };

        let (wildcard, host) = match host_part.strip_prefix("*.") {
            Some(suffix) => (true, suffix),
            None => (false, host_part),
        };

        if host.is_empty() || !host.split('.').all(valid_label) {
            return Err(RuleError::InvalidHost(raw.to_string()));
        }
        // `*.com` would admit an entire TLD.
        if wildcard && !host.contains('.') {
            return Err(RuleError::WildcardTooBroad(raw.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            wildcard,
        })
    }

    /// Ports this rule admits.
    pub fn ports(&self) -> Vec<u16> {
        match self.port {
            Some(p) => vec![p],
            None => DEFAULT_PORTS.to_vec(),
        }
    }

    /// Exact match, or for wildcards a match on a whole-label suffix.
    pub fn matches_host(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        if self.wildcard {
            hostname
                .strip_suffix(self.host.as_str())
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
        } else {
            hostname == self.host
        }
    }

    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        self.matches_host(hostname) && self.ports().contains(&port)
    }
}

impl fmt::Display for AllowlistRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            f.write_str("*.")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

/// An ordered set of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    pub rules: Vec<AllowlistRule>,
}

impl Allowlist {
    /// Parse every entry; the first malformed one fails the whole list.
    pub fn parse_all<S: AsRef<str>>(entries: &[S]) -> Result<Self, RuleError> {
        let rules = entries
            .iter()
            .map(|e| AllowlistRule::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn permits(&self, hostname: &str, port: u16) -> bool {
        self.rules.iter().any(|r| r.matches(hostname, port))
    }

    /// Rule from this list that admits the target, if any.
    pub fn matching_rule(&self, hostname: &str, port: u16) -> Option<&AllowlistRule> {
        self.rules.iter().find(|r| r.matches(hostname, port))
    }
}
