//! Capsule reads, served through the access resolver.

use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use capsule_analyzer::build_import_map;
use capsule_core::{unix_now, Manifest, Visibility};
use capsule_guard::{moderation_info, resolve_capsule, AccessDecision, ModerationInfo, Viewer};
use capsule_ratelimit::{rate_limit_key, FailurePolicy, RateLimitDecision, RateLimitRule};
use capsule_state::{CapsuleRecord, PostReference};

use crate::error::{apply_rate_limit_headers, ApiError, ApiResponse, ApiResult};
use crate::extract::{AuthUser, ClientIp, MaybeAuth};
use crate::state::AppState;

const CAPSULE_CACHE_TTL: Duration = Duration::from_secs(60);

fn cache_key(id: &str) -> String {
    format!("capsule:{id}")
}

/// Capsule row via the KV cache, falling back to the relational store and
/// repopulating the cache on a miss. The relational store always answers.
pub async fn load_capsule(state: &AppState, id: &str) -> ApiResult<Option<CapsuleRecord>> {
    let key = cache_key(id);
    match state.kv.get(&key).await {
        Ok(Some(bytes)) => match serde_json::from_slice::<CapsuleRecord>(&bytes) {
            Ok(record) => {
                debug!(%id, "capsule cache hit");
                return Ok(Some(record));
            }
            Err(e) => warn!(%id, error = %e, "discarding undecodable cached capsule"),
        },
        Ok(None) => debug!(%id, "capsule cache miss"),
        Err(e) => warn!(%id, error = %e, "kv unavailable, reading capsule from store"),
    }

    let record = state.store().get_capsule(id)?;
    if let Some(record) = &record
        && let Ok(bytes) = serde_json::to_vec(record)
        && let Err(e) = state.kv.put(&key, bytes, CAPSULE_CACHE_TTL).await
    {
        debug!(%id, error = %e, "capsule cache fill failed");
    }
    Ok(record)
}

/// Drop a cached capsule after its quarantine state changes.
pub async fn invalidate_capsule(state: &AppState, id: &str) {
    if let Err(e) = state.kv.delete(&cache_key(id)).await {
        warn!(%id, error = %e, "capsule cache invalidation failed");
    }
}

/// Load and authorize; every denial is the same 404.
async fn authorize(state: &AppState, id: &str, viewer: &Viewer) -> ApiResult<(CapsuleRecord, AccessDecision)> {
    let capsule = load_capsule(state, id).await?.ok_or_else(ApiError::not_found)?;
    let artifacts = state.store().artifacts_for_capsule(id)?;
    let references = state.store().references_for_capsule(id)?;
    let decision = resolve_capsule(&capsule, &artifacts, &references, viewer);
    if !decision.allowed {
        debug!(%id, reason = ?decision.reason, "capsule access denied");
        return Err(ApiError::not_found());
    }
    Ok((capsule, decision))
}

/// Per-address limit for public reads. Fails open.
pub async fn public_read_limit(state: &AppState, ip: &str) -> ApiResult<RateLimitDecision> {
    let rule = RateLimitRule::per_minute(state.config.rate_limit.public_read_per_minute);
    let decision = state
        .limiter
        .check(&rate_limit_key("read:ip", ip), rule, FailurePolicy::Open)
        .await;
    if !decision.allowed {
        return Err(ApiError::rate_limited("read", &decision));
    }
    Ok(decision)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub capsule_id: String,
    pub manifest: Manifest,
    pub import_map: Value,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    /// Present for the owner and moderators only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation: Option<ModerationInfo>,
}

/// GET /capsules/{id}/manifest
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: MaybeAuth,
    ClientIp(ip): ClientIp,
) -> ApiResult<Response> {
    let limit = public_read_limit(&state, &ip).await?;
    let (capsule, decision) = authorize(&state, &id, &auth.viewer()).await?;

    let privileged = decision.privileged();
    let body = ManifestResponse {
        capsule_id: capsule.id.clone(),
        import_map: build_import_map(&capsule.modules, &state.config.server.import_map_cdn),
        created_at: capsule.created_at,
        warnings: privileged.then(|| capsule.warnings.clone()),
        moderation: privileged.then(|| moderation_info(capsule.quarantine.as_ref())),
        manifest: capsule.manifest,
    };
    let mut headers = HeaderMap::new();
    apply_rate_limit_headers(&mut headers, &limit);
    Ok((headers, ApiResponse::ok(body)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct BundleQuery {
    /// File within the bundle; defaults to the entry.
    pub path: Option<String>,
}

fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") | Some("jsx") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// GET /capsules/{id}/bundle
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BundleQuery>,
    auth: MaybeAuth,
    ClientIp(ip): ClientIp,
) -> ApiResult<Response> {
    let limit = public_read_limit(&state, &ip).await?;
    let (capsule, _) = authorize(&state, &id, &auth.viewer()).await?;

    let path = query
        .path
        .map(|p| p.trim_start_matches('/').to_string())
        .unwrap_or_else(|| capsule.manifest.entry.clone());
    let bytes = state
        .content()
        .read_file(&capsule, &path)
        .await?
        .ok_or_else(ApiError::not_found)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    apply_rate_limit_headers(&mut headers, &limit);
    Ok((StatusCode::OK, headers, bytes).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRequest {
    pub post_id: String,
    #[serde(default = "default_reference_visibility")]
    pub visibility: Visibility,
}

fn default_reference_visibility() -> Visibility {
    Visibility::Public
}

/// POST /capsules/{id}/references
///
/// A caller who may not see the capsule gets the resolver's 404; one who
/// can see it but does not own it gets a 403.
pub async fn add_reference(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    Json(req): Json<ReferenceRequest>,
) -> ApiResult<Response> {
    let (capsule, _) = authorize(&state, &id, &user.viewer()).await?;
    if capsule.owner != user.0.user_id {
        return Err(ApiError::forbidden("not_owner", "only the owner can reference this capsule"));
    }
    let post_id = req.post_id.trim();
    if post_id.is_empty() || post_id.contains(':') {
        return Err(ApiError::bad_request("invalid_reference", "postId must be non-empty and contain no ':'"));
    }
    let reference = PostReference {
        capsule_id: id.clone(),
        post_id: post_id.to_string(),
        owner: capsule.owner.clone(),
        visibility: req.visibility,
        quarantined: false,
        created_at: unix_now(),
    };
    state.store().put_reference(&reference)?;
    info!(capsule = %id, post = %reference.post_id, visibility = ?reference.visibility, "reference registered");
    Ok((StatusCode::CREATED, ApiResponse::ok(reference)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type("assets/App.MJS"), "text/javascript; charset=utf-8");
        assert_eq!(content_type("LICENSE"), "application/octet-stream");
    }
}
