//! capsule-api — HTTP surface for capsule builds, reads, moderation and
//! mediated egress.
//!
//! Every JSON response uses the [`ApiResponse`] envelope. Reads of a
//! capsule or artifact the caller may not see are a plain 404, whatever
//! the reason.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | POST | `/import/github` | Build from a GitHub repository snapshot |
//! | POST | `/import/zip` | Build from an uploaded archive (raw body) |
//! | POST | `/import/snippet` | Build from inline files |
//! | GET | `/capsules/{id}/manifest` | Manifest and import map |
//! | GET | `/capsules/{id}/bundle` | Bundle file, `?path=` within it |
//! | POST | `/capsules/{id}/references` | Register a post referencing the capsule |
//! | POST | `/artifacts` | Declare an artifact and get its upload URL |
//! | GET | `/artifacts/{id}` | Artifact status |
//! | PUT | `/artifacts/{id}/sources` | Upload the source archive |
//! | POST | `/artifacts/{id}/complete` | Queue the compile |
//! | PUT | `/artifacts/{id}/visibility` | Change visibility |
//! | POST | `/moderation/capsules/{id}/quarantine` | Quarantine a capsule |
//! | POST | `/moderation/capsules/{id}/release` | Clear a capsule's quarantine |
//! | POST | `/moderation/artifacts/{id}/quarantine` | Quarantine an artifact |
//! | POST | `/moderation/artifacts/{id}/release` | Clear an artifact's quarantine |
//! | GET, POST, OPTIONS | `/proxy?url=&capsuleId=` | Mediated egress call |
//!
//! `?stream=true` on the import routes switches the response to
//! server-sent events.

pub mod artifacts;
pub mod capsules;
pub mod error;
pub mod extract;
pub mod import;
pub mod moderation;
pub mod proxy;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

pub use error::{ApiError, ApiResponse, ApiResult, ErrorBody};
pub use state::AppState;

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the complete router. Uploads read their own bodies against the
/// configured size limit, so the default body limit is lifted there.
pub fn build_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/import/zip", post(import::import_zip))
        .route("/artifacts/{id}/sources", put(artifacts::upload_sources))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/import/github", post(import::import_github))
        .route("/import/snippet", post(import::import_snippet))
        .route("/capsules/{id}/manifest", get(capsules::get_manifest))
        .route("/capsules/{id}/bundle", get(capsules::get_bundle))
        .route("/capsules/{id}/references", post(capsules::add_reference))
        .route("/artifacts", post(artifacts::create_artifact))
        .route("/artifacts/{id}", get(artifacts::get_artifact))
        .route("/artifacts/{id}/complete", post(artifacts::complete_artifact))
        .route("/artifacts/{id}/visibility", put(artifacts::set_visibility))
        .route(
            "/moderation/capsules/{id}/quarantine",
            post(moderation::quarantine_capsule),
        )
        .route("/moderation/capsules/{id}/release", post(moderation::release_capsule))
        .route(
            "/moderation/artifacts/{id}/quarantine",
            post(moderation::quarantine_artifact),
        )
        .route("/moderation/artifacts/{id}/release", post(moderation::release_artifact))
        .route(
            "/proxy",
            get(proxy::proxy).post(proxy::proxy).options(proxy::preflight),
        )
        .merge(uploads)
        .with_state(state)
}
