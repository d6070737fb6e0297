//! The response envelope and the single API error type.
//!
//! Success: `{ "success": true, "data": … }`. Failure:
//! `{ "success": false, "error": { code, message, retryable, details? } }`.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use capsule_auth::AuthError;
use capsule_build::BuildError;
use capsule_egress::EgressError;
use capsule_ratelimit::{now_ms, RateLimitDecision};
use capsule_state::StateError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
    pub headers: HeaderMap,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                retryable: false,
                details: None,
            },
            headers: HeaderMap::new(),
        }
    }

    pub fn retryable(mut self) -> Self {
        self.body.retryable = true;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.body.details = Some(details);
        self
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    /// The one not-found used for missing, private and quarantined targets.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// 429 for a denied rate-limit decision, with the standard headers.
    pub fn rate_limited(scope: &str, decision: &RateLimitDecision) -> Self {
        let retry_after = decision.retry_after_secs(now_ms());
        let (code, message) = if decision.is_unavailable() {
            ("rate_limiter_unavailable", "rate limiter unavailable".to_string())
        } else {
            ("rate_limited", format!("{scope} rate limit exceeded"))
        };
        let mut err = Self::new(StatusCode::TOO_MANY_REQUESTS, code, message)
            .retryable()
            .with_details(json!({
                "scope": scope,
                "limit": decision.limit,
                "remaining": decision.remaining,
                "retryAfter": retry_after,
            }));
        insert_header(&mut err.headers, "retry-after", retry_after.to_string());
        apply_rate_limit_headers(&mut err.headers, decision);
        err
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// `X-RateLimit-*` headers for any decision, allowed or not.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    insert_header(headers, "x-ratelimit-limit", decision.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", decision.remaining.to_string());
    insert_header(headers, "x-ratelimit-reset", decision.reset_at_secs().to_string());
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.body),
        };
        (self.status, self.headers, Json(body)).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        let code = e.code();
        let message = e.to_string();
        match &e {
            BuildError::QuotaExceeded {
                reason,
                limit,
                current,
            } => Self::new(StatusCode::TOO_MANY_REQUESTS, code, message)
                .retryable()
                .with_details(json!({ "reason": reason, "limit": limit, "current": current })),
            BuildError::BundleTooLarge { limit, size } => {
                Self::bad_request(code, message).with_details(json!({ "limit": limit, "size": size }))
            }
            BuildError::UploadTooLarge { limit } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, code, message).with_details(json!({ "limit": limit }))
            }
            BuildError::Imports(capsule_analyzer::ImportError::Rejected { violations, .. }) => {
                Self::bad_request(code, message).with_details(json!({ "violations": violations }))
            }
            BuildError::Analyze(_)
            | BuildError::Manifest(_)
            | BuildError::Bundle(_)
            | BuildError::InvalidSource(_) => Self::bad_request(code, message),
            BuildError::Download(_) => Self::new(StatusCode::BAD_GATEWAY, code, message).retryable(),
            BuildError::Timeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, code, message),
            BuildError::QueueFull | BuildError::QueueClosed => {
                Self::new(StatusCode::BAD_GATEWAY, code, message).retryable()
            }
            BuildError::Store(_) | BuildError::Internal(_) => {
                error!(error = %e, "build failed internally");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
            }
        }
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) => Self::not_found(),
            StateError::Conflict(msg) => Self::new(StatusCode::CONFLICT, "conflict", msg),
            other => {
                error!(error = %other, "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", other.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        if e.is_upstream() {
            return Self::new(StatusCode::BAD_GATEWAY, "identity_unavailable", e.to_string()).retryable();
        }
        Self::unauthorized(e.to_string())
    }
}

impl From<EgressError> for ApiError {
    fn from(e: EgressError) -> Self {
        let code = e.code();
        let message = e.to_string();
        if e.is_bad_request() {
            Self::bad_request(code, message)
        } else if e.is_policy() {
            Self::forbidden(code, message)
        } else {
            match e {
                EgressError::Timeout => Self::new(StatusCode::GATEWAY_TIMEOUT, code, message),
                EgressError::Client(_) => Self::internal(message),
                _ => Self::new(StatusCode::BAD_GATEWAY, code, message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_ratelimit::Tier;

    #[test]
    fn quota_error_is_429_with_usage() {
        let err: ApiError = BuildError::QuotaExceeded {
            reason: "storage",
            limit: 100,
            current: 100,
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.body.retryable);
        assert_eq!(err.body.details.unwrap()["limit"], 100);
    }

    #[test]
    fn oversized_bundle_is_400_with_limit_and_size() {
        let err: ApiError = BuildError::BundleTooLarge { limit: 10, size: 16 }.into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.code, "bundle_too_large");
        let details = err.body.details.unwrap();
        assert_eq!(details["limit"], 10);
        assert_eq!(details["size"], 16);
    }

    #[test]
    fn rate_limited_carries_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 100,
            remaining: 0,
            reset_at_ms: now_ms() + 40_000,
            tier: Some(Tier::Actor),
        };
        let err = ApiError::rate_limited("owner", &decision);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = err.headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((39..=40).contains(&retry));
        assert_eq!(err.headers["x-ratelimit-limit"], "100");
        assert_eq!(err.headers["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn egress_policy_is_403_and_bad_url_is_400() {
        let blocked: ApiError = EgressError::Blocked {
            host: "10.0.0.1".into(),
            reason: capsule_egress::BlockReason::PrivateAddress,
        }
        .into();
        assert_eq!(blocked.status, StatusCode::FORBIDDEN);
        assert_eq!(blocked.body.code, "private_address");
        let bad: ApiError = EgressError::UnsupportedScheme("ftp".into()).into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_record_masks_as_not_found() {
        let err: ApiError = StateError::NotFound("capsule x".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body.message, "not found");
    }
}
