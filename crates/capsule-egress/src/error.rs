use thiserror::Error;

use crate::address::BlockReason;

pub type EgressResult<T> = Result<T, EgressError>;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("host {host} is blocked: {reason}")]
    Blocked { host: String, reason: BlockReason },

    #[error("host {host}:{port} is not in the allowlist")]
    NotAllowlisted { host: String, port: u16 },

    #[error("dns resolution failed for {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream response exceeds {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    #[error("egress client error: {0}")]
    Client(String),
}

impl EgressError {
    pub fn code(&self) -> &'static str {
        match self {
            EgressError::InvalidUrl(_) => "invalid_url",
            EgressError::UnsupportedScheme(_) => "unsupported_scheme",
            EgressError::Blocked { reason, .. } => reason.code(),
            EgressError::NotAllowlisted { .. } => "host_not_allowlisted",
            EgressError::Resolve { .. } => "dns_failed",
            EgressError::Upstream(_) => "upstream_failed",
            EgressError::Timeout => "upstream_timeout",
            EgressError::ResponseTooLarge { .. } => "upstream_too_large",
            EgressError::Client(_) => "internal_error",
        }
    }

    /// Target refused by policy rather than failed in transit.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            EgressError::Blocked { .. } | EgressError::NotAllowlisted { .. }
        )
    }

    /// Caller-side problem with the URL itself.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            EgressError::InvalidUrl(_) | EgressError::UnsupportedScheme(_)
        )
    }
}

impl From<reqwest::Error> for EgressError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EgressError::Timeout
        } else {
            EgressError::Upstream(e.to_string())
        }
    }
}
