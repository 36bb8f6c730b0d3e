use crate::scheduling::RequestStatus;
use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// No worker can currently serve the requested resource/sampler combination.
    #[error("Capacity unavailable: {0}")]
    CapacityUnavailable(String),

    /// The requested status is not a legal successor of the current one.
    /// The request is left in `current`.
    #[error("Illegal transition for request {request_id}: {current} -> {requested}")]
    IllegalTransition {
        request_id: DbId,
        current: RequestStatus,
        requested: RequestStatus,
    },

    #[error("{entity} with id {id} does not belong to the current user")]
    NotOwner { entity: &'static str, id: DbId },

    /// The storage collaborator failed. Never retried internally.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
