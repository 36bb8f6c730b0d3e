//! Route definitions for the `/generation` resource.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// Routes mounted at `/generation`.
///
/// All routes require a Bearer token (enforced by handler extractors).
///
/// ```text
/// GET    /requests                -> list_requests
/// POST   /requests                -> create_request
/// GET    /requests/{id}           -> get_request
/// DELETE /requests/{id}           -> delete_request
/// POST   /requests/{id}/cancel    -> cancel_request
/// GET    /requests/{id}/generation-data -> get_generation_data
/// DELETE /images/{id}             -> delete_image
/// GET    /images/{id}/generation-data   -> get_image_generation_data
/// POST   /images/bulk-delete      -> bulk_delete_images
/// GET    /coverage                -> get_coverage
/// POST   /coverage/check          -> check_coverage
/// GET    /events                  -> stream_events
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/requests",
            get(generation::list_requests).post(generation::create_request),
        )
        .route(
            "/requests/{id}",
            get(generation::get_request).delete(generation::delete_request),
        )
        .route("/requests/{id}/cancel", post(generation::cancel_request))
        .route(
            "/requests/{id}/generation-data",
            get(generation::get_generation_data),
        )
        .route("/images/bulk-delete", post(generation::bulk_delete_images))
        .route("/images/{id}", delete(generation::delete_image))
        .route(
            "/images/{id}/generation-data",
            get(generation::get_image_generation_data),
        )
        .route("/coverage", get(generation::get_coverage))
        .route("/coverage/check", post(generation::check_coverage))
        .route("/events", get(generation::stream_events))
}
