//! Handlers for the `/generation` resource.
//!
//! All endpoints require authentication via [`AuthUser`]. Ownership checks
//! and moderator bypass live in the lifecycle manager.

use std::convert::Infallible;
use std::time::Duration;

use atelier_core::generation::{CreateGenerationRequest, ResourceReference};
use atelier_core::types::DbId;
use atelier_events::GenerationEvent;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::AppResult;
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// Query parameters for `GET /generation/requests`.
#[derive(Debug, Deserialize)]
pub struct RequestListQuery {
    /// Return requests with an id strictly below this one.
    pub cursor: Option<DbId>,
    /// Page size. Defaults to 50, clamped to 1..=100.
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteImages {
    pub ids: Vec<DbId>,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteResult {
    pub deleted: u64,
}

#[derive(Debug, Deserialize)]
pub struct CoverageCheckInput {
    pub resources: Vec<ResourceReference>,
    pub sampler: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// POST /api/v1/generation/requests
///
/// Returns 201 with the created request. A request whose job could not be
/// dispatched comes back in `Error` status.
pub async fn create_request(
    auth: AuthUser,
    State(state): State<AppState>,
    AppJson(input): AppJson<CreateGenerationRequest>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .create_request(&auth.actor(), input)
        .await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: request })))
}

/// GET /api/v1/generation/requests
pub async fn list_requests(
    auth: AuthUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<RequestListQuery>,
) -> AppResult<impl IntoResponse> {
    let page = state
        .generation
        .get_requests(&auth.actor(), params.cursor, params.limit)
        .await?;
    Ok(Json(DataResponse { data: page }))
}

/// GET /api/v1/generation/requests/{id}
pub async fn get_request(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .get_request(&auth.actor(), request_id)
        .await?;
    Ok(Json(DataResponse { data: request }))
}

/// POST /api/v1/generation/requests/{id}/cancel
///
/// Idempotent: cancelling a finished request returns it unchanged.
pub async fn cancel_request(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .generation
        .cancel_request(&auth.actor(), request_id)
        .await?;
    Ok(Json(DataResponse { data: request }))
}

/// DELETE /api/v1/generation/requests/{id}
pub async fn delete_request(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
) -> AppResult<StatusCode> {
    state
        .generation
        .delete_request(&auth.actor(), request_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/generation/requests/{id}/generation-data
///
/// The request's settings as a body `POST /requests` accepts.
pub async fn get_generation_data(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(request_id): AppPath<DbId>,
) -> AppResult<impl IntoResponse> {
    let data = state
        .generation
        .get_generation_data(&auth.actor(), request_id)
        .await?;
    Ok(Json(DataResponse { data }))
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// GET /api/v1/generation/images/{id}/generation-data
pub async fn get_image_generation_data(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(image_id): AppPath<DbId>,
) -> AppResult<impl IntoResponse> {
    let data = state
        .generation
        .get_image_generation_data(&auth.actor(), image_id)
        .await?;
    Ok(Json(DataResponse { data }))
}

/// DELETE /api/v1/generation/images/{id}
pub async fn delete_image(
    auth: AuthUser,
    State(state): State<AppState>,
    AppPath(image_id): AppPath<DbId>,
) -> AppResult<StatusCode> {
    state.generation.delete_image(&auth.actor(), image_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/generation/images/bulk-delete
///
/// All or nothing: one missing or foreign id fails the whole batch.
pub async fn bulk_delete_images(
    auth: AuthUser,
    State(state): State<AppState>,
    AppJson(input): AppJson<BulkDeleteImages>,
) -> AppResult<impl IntoResponse> {
    let deleted = state
        .generation
        .bulk_delete_images(&auth.actor(), &input.ids)
        .await?;
    Ok(Json(DataResponse {
        data: BulkDeleteResult { deleted },
    }))
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// POST /api/v1/generation/coverage/check
pub async fn check_coverage(
    _auth: AuthUser,
    State(state): State<AppState>,
    AppJson(input): AppJson<CoverageCheckInput>,
) -> AppResult<impl IntoResponse> {
    let check = state
        .generation
        .check_resources_coverage(&input.resources, &input.sampler);
    Ok(Json(DataResponse { data: check }))
}

/// GET /api/v1/generation/coverage
pub async fn get_coverage(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let coverage = state.generation.get_coverage();
    Ok(Json(DataResponse {
        data: coverage.as_ref().clone(),
    }))
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// SSE keep-alive interval.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn to_sse(event: &GenerationEvent) -> Option<Event> {
    match Event::default()
        .event(event.kind.event_type())
        .json_data(event)
    {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode generation event");
            None
        }
    }
}

/// GET /api/v1/generation/events
///
/// Server-sent events for the caller's own requests. A subscriber that falls
/// behind skips the missed events; clients resynchronise by refetching.
pub async fn stream_events(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user_id = auth.user_id;
    tracing::debug!(user_id, "Generation event stream opened");

    let stream = BroadcastStream::new(state.event_bus.subscribe()).filter_map(move |message| {
        match message {
            Ok(event) if event.user_id == user_id => to_sse(&event).map(Ok),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(user_id, skipped, "Generation event stream lagged");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
