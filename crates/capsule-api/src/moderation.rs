//! Moderator actions. Quarantine is only ever set or cleared here and by the
//! build-time safety scan; serving paths never change it.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use capsule_core::{unix_now, PolicyStatus, Quarantine, QuarantineSource};
use capsule_guard::{moderation_info, ModerationInfo};

use crate::capsules::invalidate_capsule;
use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::extract::AuthUser;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct QuarantineRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationResult {
    pub id: String,
    pub moderation: ModerationInfo,
}

fn require_moderator(user: &AuthUser) -> ApiResult<()> {
    if !user.0.moderator {
        return Err(ApiError::forbidden("not_moderator", "moderator role required"));
    }
    Ok(())
}

/// The body is optional; an empty one means no stated reason.
fn parse_request(body: &[u8]) -> ApiResult<QuarantineRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(QuarantineRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request("invalid_body", e.to_string()))
}

fn moderator_flag(req: QuarantineRequest) -> Quarantine {
    Quarantine {
        reason: req
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "moderator action".to_string()),
        source: QuarantineSource::Moderator,
        quarantined_at: unix_now(),
    }
}

async fn set_capsule(state: &AppState, id: &str, quarantine: Option<Quarantine>) -> ApiResult<ModerationResult> {
    if state.store().get_capsule(id)?.is_none() {
        return Err(ApiError::not_found());
    }
    let record = state.store().set_capsule_quarantine(id, quarantine)?;
    invalidate_capsule(state, id).await;
    Ok(ModerationResult {
        id: record.id,
        moderation: moderation_info(record.quarantine.as_ref()),
    })
}

fn set_artifact(state: &AppState, id: &str, quarantine: Option<Quarantine>) -> ApiResult<ModerationResult> {
    if state.store().get_artifact(id)?.is_none() {
        return Err(ApiError::not_found());
    }
    let record = state.store().update_artifact(id, |a| {
        a.policy = if quarantine.is_some() {
            PolicyStatus::Quarantined
        } else {
            PolicyStatus::Active
        };
        a.quarantine = quarantine;
        Ok(())
    })?;
    Ok(ModerationResult {
        id: record.id,
        moderation: moderation_info(record.quarantine.as_ref()),
    })
}

/// POST /moderation/capsules/{id}/quarantine
pub async fn quarantine_capsule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<ModerationResult>>> {
    require_moderator(&user)?;
    let flag = moderator_flag(parse_request(&body)?);
    info!(capsule = %id, moderator = %user.0.user_id, reason = %flag.reason, "capsule quarantined");
    let result = set_capsule(&state, &id, Some(flag)).await?;
    Ok(ApiResponse::ok(result))
}

/// POST /moderation/capsules/{id}/release
pub async fn release_capsule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> ApiResult<Json<ApiResponse<ModerationResult>>> {
    require_moderator(&user)?;
    info!(capsule = %id, moderator = %user.0.user_id, "capsule released");
    let result = set_capsule(&state, &id, None).await?;
    Ok(ApiResponse::ok(result))
}

/// POST /moderation/artifacts/{id}/quarantine
pub async fn quarantine_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<ModerationResult>>> {
    require_moderator(&user)?;
    let flag = moderator_flag(parse_request(&body)?);
    info!(artifact = %id, moderator = %user.0.user_id, reason = %flag.reason, "artifact quarantined");
    let result = set_artifact(&state, &id, Some(flag))?;
    Ok(ApiResponse::ok(result))
}

/// POST /moderation/artifacts/{id}/release
pub async fn release_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> ApiResult<Json<ApiResponse<ModerationResult>>> {
    require_moderator(&user)?;
    info!(artifact = %id, moderator = %user.0.user_id, "artifact released");
    let result = set_artifact(&state, &id, None)?;
    Ok(ApiResponse::ok(result))
}
