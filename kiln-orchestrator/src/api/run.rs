//! Run API Handlers
//!
//! HTTP endpoints for run submission, inspection, cancellation, log tailing,
//! artifact download and rollback.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use kiln_core::domain::log::LogTail;
use kiln_core::domain::run::{Artifact, Run};
use kiln_core::dto::batch::{BatchDelete, BatchDeleteResult};
use kiln_core::dto::log::TailQuery;
use kiln_core::dto::page::Page;
use kiln_core::dto::run::{CancelResponse, RollbackRequest, RunQuery, SubmitResponse, SubmitRun};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::storage::contained_path;

// =============================================================================
// Run Lifecycle Endpoints
// =============================================================================

/// POST /runs
/// Submit a run of a configuration
pub async fn submit_run(
    State(state): State<AppState>,
    Json(req): Json<SubmitRun>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    tracing::info!("Submitting run of configuration: {}", req.configuration_id);

    let run = state
        .dispatcher
        .submit(
            req.configuration_id,
            req.source,
            req.operator.as_deref(),
            req.branch,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id: run.id,
            number: run.number,
        }),
    ))
}

/// POST /runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    tracing::info!("Cancelling run: {}", id);

    state.engine.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(CancelResponse::Accepted)))
}

/// GET /runs/{id}
/// Latest snapshot of a run, never waits on the run itself
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(state.engine.status(id).await?))
}

/// GET /runs
/// Paginated run history, newest first unless `ascending` is set
///
/// Query parameters:
/// - `configuration_id`, `status`, `since`, `until` (optional filters)
/// - `page`, `page_size`, `ascending`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<Page<Run>>> {
    tracing::debug!("Listing runs: {:?}", query);

    let page = state.engine.services().history.query(&query).await?;
    Ok(Json(page))
}

/// DELETE /runs/{id}
/// Delete a terminal run with its artifact and log
pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting run: {}", id);

    state.engine.services().history.delete_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /runs
/// Delete several terminal runs; active ones are reported, not deleted
pub async fn delete_runs(
    State(state): State<AppState>,
    Json(req): Json<BatchDelete>,
) -> ApiResult<Json<BatchDeleteResult>> {
    tracing::info!("Deleting {} run(s)", req.ids.len());

    let history = &state.engine.services().history;
    let mut result = BatchDeleteResult::default();
    for id in req.ids {
        match history.delete_run(id).await {
            Ok(()) => result.deleted.push(id),
            Err(e) => result.failed.push(ApiError::from(e).into_batch_failure(id)),
        }
    }
    Ok(Json(result))
}

/// POST /runs/{id}/rollback
/// Redeploy the artifact of a historical run
pub async fn rollback_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RollbackRequest>>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    tracing::info!("Rolling back to run: {}", id);

    let operator = body.and_then(|Json(req)| req.operator);
    let run = state.dispatcher.rollback(id, operator.as_deref()).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id: run.id,
            number: run.number,
        }),
    ))
}

// =============================================================================
// Log Endpoints
// =============================================================================

/// GET /runs/{id}/log
/// One batch of console output, for repeated polling
///
/// Query parameters:
/// - `from_line` (1-based, default 1)
/// - `max_lines` (default 500)
pub async fn tail_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TailQuery>,
) -> ApiResult<Json<LogTail>> {
    let tail = state
        .engine
        .tail(id, query.from_line(), query.max_lines())
        .await?;
    Ok(Json(tail))
}

/// GET /runs/{id}/log/download
/// Whole log as plain text
pub async fn download_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let tail = state.engine.tail(id, 1, usize::MAX).await?;

    let mut text = tail.lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.log\"", id),
            ),
        ],
        text,
    ))
}

// =============================================================================
// Artifact Endpoints
// =============================================================================

/// GET /runs/{id}/artifact
/// Manifest of the run's packaged files
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Artifact>> {
    let artifact = retained_artifact(&state, id).await?;
    Ok(Json(artifact))
}

/// GET /runs/{id}/artifact/{*path}
/// One packaged file
pub async fn download_artifact_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(Uuid, String)>,
) -> ApiResult<FileDownload> {
    artifact_file(&state, id, &path).await
}

/// GET /configurations/{id}/runs/{number}/artifact
/// Manifest of a run addressed by its number
pub async fn get_artifact_by_number(
    State(state): State<AppState>,
    Path((configuration_id, number)): Path<(Uuid, i64)>,
) -> ApiResult<Json<Artifact>> {
    let id = run_id_by_number(&state, configuration_id, number).await?;
    Ok(Json(retained_artifact(&state, id).await?))
}

/// GET /configurations/{id}/runs/{number}/artifact/{*path}
/// One packaged file of a run addressed by its number
pub async fn download_artifact_file_by_number(
    State(state): State<AppState>,
    Path((configuration_id, number, path)): Path<(Uuid, i64, String)>,
) -> ApiResult<FileDownload> {
    let id = run_id_by_number(&state, configuration_id, number).await?;
    artifact_file(&state, id, &path).await
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn run_id_by_number(state: &AppState, configuration_id: Uuid, number: i64) -> ApiResult<Uuid> {
    state
        .engine
        .services()
        .history
        .find_by_number(configuration_id, number)
        .await?
        .map(|run| run.id)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "Configuration {} has no run #{}",
                configuration_id, number
            ))
        })
}

/// Headers and body of a downloaded artifact file
type FileDownload = ([(header::HeaderName, String); 2], Vec<u8>);

async fn artifact_file(state: &AppState, id: Uuid, path: &str) -> ApiResult<FileDownload> {
    let artifact = retained_artifact(state, id).await?;

    let relative = path.trim_start_matches('/');
    if !artifact.files.iter().any(|f| f == relative) {
        return Err(ApiError::NotFound(format!(
            "Artifact of run {} has no file '{}'",
            id, relative
        )));
    }
    let file = contained_path(std::path::Path::new(&artifact.location), relative)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid artifact path '{}'", relative)))?;

    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!(
                "Artifact of run {} has been pruned",
                id
            )));
        }
        Err(e) => return Err(ApiError::InternalError(format!("Failed to read artifact: {}", e))),
    };

    let filename = relative.rsplit('/').next().unwrap_or(relative).to_string();
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}

/// Artifact of a run whose files are still on disk
async fn retained_artifact(state: &AppState, id: Uuid) -> ApiResult<Artifact> {
    let run = state.engine.status(id).await?;
    let artifact = run
        .artifact
        .ok_or_else(|| ApiError::NotFound(format!("Run {} has no artifact", id)))?;

    if !tokio::fs::try_exists(&artifact.location).await.unwrap_or(false) {
        return Err(ApiError::NotFound(format!(
            "Artifact of run {} has been pruned",
            id
        )));
    }
    Ok(artifact)
}
