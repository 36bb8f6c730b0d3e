pub mod generation;
pub mod health;
pub mod workers;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /generation/requests                      list, create
/// /generation/requests/{id}                 get, delete
/// /generation/requests/{id}/cancel          cancel (POST)
/// /generation/images/{id}                   delete
/// /generation/images/bulk-delete            bulk delete (POST)
/// /generation/coverage                      current coverage snapshot
/// /generation/coverage/check                resource/sampler check (POST)
/// /generation/events                        server-sent events
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/generation", generation::router())
}

/// Build the `/internal/v1` route tree used by workers.
///
/// ```text
/// /jobs/claim                               claim next job (POST)
/// /requests/{id}/status                     status callback (PUT)
/// /requests/{id}/images                     attach images (POST)
/// /requests/{id}/complete                   attach and succeed (POST)
/// /images/{id}/available                    mark image available (POST)
/// ```
pub fn internal_routes() -> Router<AppState> {
    workers::router()
}
