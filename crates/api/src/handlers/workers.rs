//! Handlers for the worker-facing `/internal/v1` routes.
//!
//! Every handler takes [`WorkerAuth`], so calls without the shared worker
//! token are rejected before reaching the lifecycle manager.

use std::time::Duration;

use atelier_core::generation::NewGeneratedImage;
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::DbId;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::middleware::auth::WorkerAuth;
use crate::response::DataResponse;
use crate::state::AppState;

/// Longest a claim call may wait for a job to arrive.
const MAX_CLAIM_WAIT_MS: u64 = 25_000;

#[derive(Debug, Deserialize)]
pub struct ClaimQuery {
    /// How long to wait for a job, in milliseconds. Defaults to no wait.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: RequestStatus,
}

#[derive(Debug, Deserialize)]
pub struct ImagesPayload {
    pub images: Vec<NewGeneratedImage>,
}

/// POST /internal/v1/jobs/claim
///
/// 200 with the claimed request (now `Processing`), or 204 when no job
/// arrived within `wait_ms`.
pub async fn claim_job(
    _worker: WorkerAuth,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ClaimQuery>,
) -> AppResult<Response> {
    let wait = Duration::from_millis(params.wait_ms.unwrap_or(0).min(MAX_CLAIM_WAIT_MS));
    match state.generation.claim_next_job(wait).await? {
        Some(request) => Ok(Json(DataResponse { data: request }).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// PUT /internal/v1/requests/{id}/status
pub async fn update_status(
    _worker: WorkerAuth,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
    AppJson(input): AppJson<StatusUpdate>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .update_status(request_id, input.status)
        .await?;
    Ok(Json(DataResponse { data: request }))
}

/// POST /internal/v1/requests/{id}/images
pub async fn attach_images(
    _worker: WorkerAuth,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
    AppJson(input): AppJson<ImagesPayload>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .attach_images(request_id, input.images)
        .await?;
    Ok(Json(DataResponse { data: request }))
}

/// POST /internal/v1/requests/{id}/complete
pub async fn complete_request(
    _worker: WorkerAuth,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
    AppJson(input): AppJson<ImagesPayload>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .complete_request(request_id, input.images)
        .await?;
    Ok(Json(DataResponse { data: request }))
}

/// POST /internal/v1/images/{id}/available
pub async fn mark_image_available(
    _worker: WorkerAuth,
    State(state): State<AppState>,
    AppPath(image_id): AppPath<DbId>,
) -> AppResult<impl IntoResponse> {
    let image = state.generation.mark_image_available(image_id).await?;
    Ok(Json(DataResponse { data: image }))
}
