//! Import endpoints: GitHub repository, uploaded zip, inline snippet.
//!
//! Each accepts `?stream=true` to receive server-sent `progress` events
//! followed by exactly one `result` or `error` event. The JSON and
//! streamed forms drive the same pipeline run.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http_body_util::LengthLimitError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use capsule_analyzer::{build_import_map, AnalysisWarning};
use capsule_build::{
    parse_github_url, BuildError, BuildOutcome, BuildRequest, BuildResult, BuildSource, GithubSource,
    ProgressEvent, ProgressSink, Stage,
};
use capsule_core::{FileMap, Manifest, PlanTier, RunnerType, UserId};

use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::extract::AuthUser;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportQuery {
    #[serde(default)]
    pub stream: bool,
    /// Drop a single top-level directory shared by every entry.
    pub strip_root: Option<bool>,
    pub runner: Option<RunnerType>,
}

#[derive(Debug, Deserialize)]
pub struct GithubImportRequest {
    pub url: String,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnippetImportRequest {
    /// Path → source text.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Shorthand for a single `index.html`.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub runner: Option<RunnerType>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub capsule_id: String,
    pub hash: String,
    pub deduplicated: bool,
    pub manifest: Manifest,
    pub warnings: Vec<AnalysisWarning>,
    pub quarantined: bool,
    pub import_map: Value,
}

impl BuildResponse {
    fn from_outcome(outcome: BuildOutcome, cdn: &str) -> Self {
        Self {
            capsule_id: outcome.capsule.id.clone(),
            hash: outcome.capsule.hash.clone(),
            deduplicated: outcome.deduplicated,
            quarantined: outcome.capsule.is_quarantined(),
            import_map: build_import_map(&outcome.modules, cdn),
            manifest: outcome.capsule.manifest,
            warnings: outcome.warnings,
        }
    }
}

/// A source that may still need fetching before the pipeline starts.
enum PendingSource {
    Ready(BuildSource),
    Github(GithubSource),
}

struct BuildJob {
    owner: UserId,
    plan: PlanTier,
    source: PendingSource,
    runner: Option<RunnerType>,
}

async fn execute(state: &AppState, job: BuildJob, progress: &ProgressSink) -> BuildResult<BuildOutcome> {
    let source = match job.source {
        PendingSource::Ready(source) => source,
        PendingSource::Github(repo) => {
            // Fail fast on quota before spending a download on it.
            state.pipeline.check_quota(&job.owner, job.plan)?;
            progress
                .emit(
                    Stage::Analyzing,
                    Some(format!("downloading {}/{}", repo.owner, repo.repo)),
                )
                .await;
            let max = state.config.server.max_upload_bytes;
            let bytes = match state.fetcher.fetch(&repo, max).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    progress.emit(Stage::Failed, Some(e.to_string())).await;
                    return Err(e);
                }
            };
            BuildSource::Zip {
                bytes,
                strip_common_root: true,
            }
        }
    };
    state
        .pipeline
        .run(
            BuildRequest {
                owner: job.owner,
                plan: Some(job.plan),
                source,
                runner: job.runner,
            },
            progress,
        )
        .await
}

async fn respond(state: AppState, job: BuildJob, stream: bool) -> Response {
    if stream {
        return stream_build(state, job).into_response();
    }
    let cdn = state.config.server.import_map_cdn.clone();
    match execute(&state, job, &ProgressSink::none()).await {
        Ok(outcome) => {
            let status = if outcome.deduplicated {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, ApiResponse::ok(BuildResponse::from_outcome(outcome, &cdn))).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Aborts the build task when the event stream is dropped, so a client
/// that goes away cancels its build.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Feed {
    Progress {
        rx: mpsc::Receiver<ProgressEvent>,
        task: AbortOnDrop<BuildResult<BuildResponse>>,
    },
    Finished,
}

fn progress_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event("progress")
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("progress"))
}

fn final_event(result: Result<BuildResult<BuildResponse>, tokio::task::JoinError>) -> Event {
    let outcome = match result {
        Ok(Ok(body)) => Event::default().event("result").json_data(&body),
        Ok(Err(e)) => Event::default().event("error").json_data(&ApiError::from(e).body),
        Err(e) => Event::default()
            .event("error")
            .json_data(&ApiError::internal(format!("build task failed: {e}")).body),
    };
    outcome.unwrap_or_else(|_| Event::default().event("error").data("internal_error"))
}

fn stream_build(state: AppState, job: BuildJob) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (sink, rx) = ProgressSink::channel(32);
    let cdn = state.config.server.import_map_cdn.clone();
    let task = tokio::spawn(async move {
        let outcome = execute(&state, job, &sink).await?;
        Ok(BuildResponse::from_outcome(outcome, &cdn))
    });

    let feed = Feed::Progress {
        rx,
        task: AbortOnDrop(task),
    };
    let stream = futures::stream::unfold(feed, |feed| async move {
        match feed {
            Feed::Progress { mut rx, mut task } => match rx.recv().await {
                Some(event) => Some((Ok::<_, Infallible>(progress_event(&event)), Feed::Progress { rx, task })),
                None => {
                    let result = (&mut task.0).await;
                    Some((Ok(final_event(result)), Feed::Finished))
                }
            },
            Feed::Finished => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /import/github
pub async fn import_github(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Query(query): Query<ImportQuery>,
    Json(req): Json<GithubImportRequest>,
) -> Response {
    let repo = match parse_github_url(&req.url, req.reference.as_deref()) {
        Ok(repo) => repo,
        Err(e) => return ApiError::from(e).into_response(),
    };
    info!(owner = %identity.user_id, repo = %format!("{}/{}", repo.owner, repo.repo), "github import");
    let job = BuildJob {
        owner: identity.user_id,
        plan: identity.plan,
        source: PendingSource::Github(repo),
        runner: query.runner,
    };
    respond(state, job, query.stream).await
}

/// POST /import/zip — the request body is the archive.
pub async fn import_zip(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Query(query): Query<ImportQuery>,
    body: Body,
) -> Response {
    let bytes = match read_body(body, state.config.server.max_upload_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };
    if bytes.is_empty() {
        return ApiError::bad_request("invalid_archive", "empty upload").into_response();
    }
    info!(owner = %identity.user_id, bytes = bytes.len(), "zip import");
    let job = BuildJob {
        owner: identity.user_id,
        plan: identity.plan,
        source: PendingSource::Ready(BuildSource::Zip {
            bytes,
            strip_common_root: query.strip_root.unwrap_or(true),
        }),
        runner: query.runner,
    };
    respond(state, job, query.stream).await
}

/// POST /import/snippet
pub async fn import_snippet(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Query(query): Query<ImportQuery>,
    Json(req): Json<SnippetImportRequest>,
) -> Response {
    let mut files: FileMap = req
        .files
        .into_iter()
        .map(|(path, text)| (path.trim_start_matches("./").to_string(), text.into_bytes()))
        .collect();
    if let Some(code) = req.code {
        files.insert("index.html".to_string(), code.into_bytes());
    }
    if files.is_empty() {
        return ApiError::bad_request("invalid_source", "snippet has no files").into_response();
    }
    let size: u64 = files.values().map(|b| b.len() as u64).sum();
    if size > state.config.server.max_upload_bytes {
        return ApiError::from(BuildError::UploadTooLarge {
            limit: state.config.server.max_upload_bytes,
        })
        .into_response();
    }
    let job = BuildJob {
        owner: identity.user_id,
        plan: identity.plan,
        source: PendingSource::Ready(BuildSource::Files(files)),
        runner: req.runner.or(query.runner),
    };
    respond(state, job, query.stream).await
}

/// Read a request body up to `limit` bytes; larger bodies are a 413.
pub async fn read_body(body: Body, limit: u64) -> ApiResult<Vec<u8>> {
    let cap = usize::try_from(limit).unwrap_or(usize::MAX);
    match axum::body::to_bytes(body, cap).await {
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => {
            let inner = e.into_inner();
            if exceeds_limit(inner.as_ref()) {
                Err(BuildError::UploadTooLarge { limit }.into())
            } else {
                Err(ApiError::bad_request("invalid_body", inner.to_string()))
            }
        }
    }
}

fn exceeds_limit(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
