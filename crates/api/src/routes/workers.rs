//! Worker-facing routes. Mounted at `/internal/v1`.

use axum::routing::{post, put};
use axum::Router;

use crate::handlers::workers;
use crate::state::AppState;

/// All routes require the `x-worker-token` header.
///
/// ```text
/// POST /jobs/claim                 -> claim_job
/// PUT  /requests/{id}/status       -> update_status
/// POST /requests/{id}/images       -> attach_images
/// POST /requests/{id}/complete     -> complete_request
/// POST /images/{id}/available      -> mark_image_available
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/claim", post(workers::claim_job))
        .route("/requests/{id}/status", put(workers::update_status))
        .route("/requests/{id}/images", post(workers::attach_images))
        .route("/requests/{id}/complete", post(workers::complete_request))
        .route("/images/{id}/available", post(workers::mark_image_available))
}
