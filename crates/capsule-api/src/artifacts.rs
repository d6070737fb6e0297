//! Three-phase artifact publish and artifact reads.
//!
//! `POST /artifacts` declares a draft, `PUT /artifacts/{id}/sources`
//! uploads the source archive, `POST /artifacts/{id}/complete` queues the
//! compile. The compile worker moves the draft to `active` or `failed`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use capsule_build::BuildError;
use capsule_core::{parse_runtime_version, unix_now, ArtifactStatus, PolicyStatus, RunnerType, Visibility};
use capsule_guard::{moderation_info, resolve_artifact, ModerationInfo};
use capsule_state::ArtifactRecord;

use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::extract::{AuthUser, MaybeAuth};
use crate::import::read_body;
use crate::state::AppState;

fn source_key(id: &str) -> String {
    format!("sources/{id}.zip")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactRequest {
    #[serde(rename = "type")]
    pub runner: RunnerType,
    pub runtime_version: String,
    /// Size of the sources archive that will be uploaded.
    pub size: u64,
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIntent {
    pub artifact_id: String,
    pub upload_url: String,
    pub complete_url: String,
    pub status: ArtifactStatus,
}

/// Owner's view includes the moderation block.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactView {
    #[serde(flatten)]
    pub artifact: ArtifactRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation: Option<ModerationInfo>,
}

/// Load an artifact the caller owns: 404 when absent, 403 otherwise.
fn owned_artifact(state: &AppState, id: &str, user: &AuthUser) -> ApiResult<ArtifactRecord> {
    let artifact = state.store().get_artifact(id)?.ok_or_else(ApiError::not_found)?;
    if artifact.owner != user.0.user_id {
        return Err(ApiError::forbidden("not_owner", "only the owner can modify this artifact"));
    }
    Ok(artifact)
}

/// POST /artifacts
pub async fn create_artifact(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateArtifactRequest>,
) -> ApiResult<Response> {
    let version = parse_runtime_version(&req.runtime_version).map_err(|e| {
        ApiError::bad_request("invalid_runtime_version", format!("{}: {e}", req.runtime_version))
    })?;
    let limits = state.pipeline.check_quota(&user.0.user_id, user.0.plan)?;
    if req.size > limits.max_bundle_bytes {
        return Err(BuildError::BundleTooLarge {
            limit: limits.max_bundle_bytes,
            size: req.size,
        }
        .into());
    }
    if req.size == 0 || req.size > state.config.server.max_upload_bytes {
        return Err(ApiError::bad_request(
            "invalid_size",
            format!("size must be between 1 and {} bytes", state.config.server.max_upload_bytes),
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = unix_now();
    let record = ArtifactRecord {
        id: id.clone(),
        owner: user.0.user_id.clone(),
        plan: user.0.plan,
        capsule_id: None,
        runner: req.runner,
        runtime_version: version.to_string(),
        bundle_digest: None,
        status: ArtifactStatus::Draft,
        policy: PolicyStatus::Active,
        visibility: req.visibility,
        declared_size: req.size,
        source_key: None,
        quarantine: None,
        error: None,
        created_at: now,
        updated_at: now,
    };
    state.store().put_artifact(&record)?;
    info!(artifact = %id, owner = %record.owner, runner = %record.runner, "artifact declared");

    let intent = UploadIntent {
        upload_url: format!("/artifacts/{id}/sources"),
        complete_url: format!("/artifacts/{id}/complete"),
        artifact_id: id,
        status: ArtifactStatus::Draft,
    };
    Ok((StatusCode::CREATED, ApiResponse::ok(intent)).into_response())
}

/// PUT /artifacts/{id}/sources — the request body is the source archive.
pub async fn upload_sources(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    body: Body,
) -> ApiResult<Response> {
    let artifact = owned_artifact(&state, &id, &user)?;
    if artifact.status != ArtifactStatus::Draft {
        return Err(ApiError::new(StatusCode::CONFLICT, "not_draft", "artifact is no longer a draft"));
    }
    let bytes = read_body(body, artifact.declared_size).await?;
    if bytes.len() as u64 != artifact.declared_size {
        return Err(ApiError::bad_request("size_mismatch", "upload size differs from the declared size")
            .with_details(json!({ "declared": artifact.declared_size, "received": bytes.len() })));
    }

    let key = source_key(&id);
    state.content().blobs().put(&key, &bytes).await?;
    let record = state.store().update_artifact(&id, |a| {
        a.source_key = Some(key);
        Ok(())
    })?;
    info!(artifact = %id, bytes = bytes.len(), "artifact sources uploaded");
    Ok(ApiResponse::ok(record).into_response())
}

/// POST /artifacts/{id}/complete
pub async fn complete_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> ApiResult<Response> {
    let artifact = owned_artifact(&state, &id, &user)?;
    if artifact.status != ArtifactStatus::Draft {
        return Err(ApiError::new(StatusCode::CONFLICT, "not_draft", "artifact is no longer a draft"));
    }
    if artifact.source_key.is_none() {
        return Err(ApiError::bad_request("sources_missing", "upload sources before completing"));
    }
    state.compile_queue.enqueue(&id)?;
    info!(artifact = %id, "artifact compile queued");
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(json!({ "artifactId": id, "status": ArtifactStatus::Draft, "queued": true })),
    )
        .into_response())
}

/// GET /artifacts/{id}
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: MaybeAuth,
) -> ApiResult<Json<ApiResponse<ArtifactView>>> {
    let artifact = state.store().get_artifact(&id)?.ok_or_else(ApiError::not_found)?;
    let decision = resolve_artifact(&artifact, &auth.viewer());
    if !decision.allowed {
        return Err(ApiError::not_found());
    }
    let moderation = decision
        .privileged()
        .then(|| moderation_info(artifact.quarantine.as_ref()));
    Ok(ApiResponse::ok(ArtifactView { artifact, moderation }))
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

/// PUT /artifacts/{id}/visibility
pub async fn set_visibility(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    Json(req): Json<VisibilityRequest>,
) -> ApiResult<Json<ApiResponse<ArtifactRecord>>> {
    owned_artifact(&state, &id, &user)?;
    let record = state.store().update_artifact(&id, |a| {
        a.visibility = req.visibility;
        Ok(())
    })?;
    info!(artifact = %id, visibility = ?record.visibility, "artifact visibility changed");
    Ok(ApiResponse::ok(record))
}
