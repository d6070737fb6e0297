//! Mediated egress on behalf of a running capsule.
//!
//! Checks run in this order: target URL and literal address class, capsule
//! ownership, both rate limits, the effective allowlist, then the pinned
//! fetch. Any failure before the fetch means no outbound connection.

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info, warn};

use capsule_egress::{apply_cors, parse_target, EffectiveAllowlist, EgressRequest};
use capsule_ratelimit::{rate_limit_key, FailurePolicy, RateLimitDecision, RateLimitRule};

use crate::capsules::load_capsule;
use crate::error::{apply_rate_limit_headers, ApiError, ApiResult};
use crate::extract::{AuthUser, ClientIp};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyQuery {
    pub url: String,
    pub capsule_id: String,
}

/// Both limits are evaluated concurrently and both must pass. An exhausted
/// limiter denies the call.
async fn check_limits(state: &AppState, user: &AuthUser, ip: &str) -> ApiResult<RateLimitDecision> {
    let plan = state.config.limits_for(user.0.plan);
    let user_key = rate_limit_key("proxy:user", &user.0.user_id);
    let ip_key = rate_limit_key("proxy:ip", ip);
    let (by_user, by_ip) = tokio::join!(
        state.limiter.check(
            &user_key,
            RateLimitRule::per_minute(plan.proxy_per_minute),
            FailurePolicy::Closed,
        ),
        state.limiter.check(
            &ip_key,
            RateLimitRule::per_minute(state.config.egress.per_ip_per_minute),
            FailurePolicy::Closed,
        ),
    );
    if !by_user.allowed {
        warn!(user = %user.0.user_id, tier = ?by_user.tier, "proxy user limit reached");
        return Err(ApiError::rate_limited("proxy_user", &by_user));
    }
    if !by_ip.allowed {
        warn!(%ip, tier = ?by_ip.tier, "proxy address limit reached");
        return Err(ApiError::rate_limited("proxy_ip", &by_ip));
    }
    Ok(if by_ip.remaining < by_user.remaining { by_ip } else { by_user })
}

/// GET|POST /proxy?url=&capsuleId=
pub async fn proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    user: AuthUser,
    ClientIp(ip): ClientIp,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let target = parse_target(&query.url)?;

    let capsule = load_capsule(&state, &query.capsule_id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    if capsule.owner != user.0.user_id {
        warn!(capsule = %capsule.id, caller = %user.0.user_id, "cross-tenant proxy attempt");
        return Err(ApiError::forbidden("not_owner", "capsule belongs to another user"));
    }

    let limit = check_limits(&state, &user, &ip).await?;

    let manifest_list = capsule
        .manifest
        .capabilities
        .allowlist()
        .map_err(|e| ApiError::internal(format!("stored manifest has an invalid net rule: {e}")))?;
    let effective = EffectiveAllowlist::new(&manifest_list, &state.global_allowlist);
    if effective.is_empty() {
        debug!(capsule = %capsule.id, "effective allowlist is empty");
    }
    effective.authorize(&target)?;

    let request = EgressRequest {
        method,
        headers,
        body: (!body.is_empty()).then_some(body),
    };
    let upstream = state.egress.fetch(&target, request).await?;
    info!(
        capsule = %capsule.id,
        host = %target.host,
        status = upstream.status.as_u16(),
        "proxied call"
    );

    let mut response_headers = upstream.headers;
    apply_rate_limit_headers(&mut response_headers, &limit);
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// OPTIONS /proxy
pub async fn preflight() -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    (StatusCode::NO_CONTENT, headers).into_response()
}
