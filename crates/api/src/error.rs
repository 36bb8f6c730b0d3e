use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use atelier_core::error::CoreError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds decoding failures.
/// Every variant renders as `{ "error": ..., "code": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The request could not be decoded (body, path or query).
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Map a domain error to status, code and client-facing message.
fn classify_core_error(core: &CoreError) -> (StatusCode, &'static str, String) {
    match core {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::CapacityUnavailable(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "CAPACITY_UNAVAILABLE",
            msg.clone(),
        ),
        CoreError::IllegalTransition { .. } => {
            (StatusCode::CONFLICT, "ILLEGAL_TRANSITION", core.to_string())
        }
        CoreError::NotOwner { .. } => (StatusCode::FORBIDDEN, "NOT_OWNER", core.to_string()),
        CoreError::StorageUnavailable(msg) => {
            tracing::error!(error = %msg, "Storage unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "Storage is temporarily unavailable".to_string(),
            )
        }
        CoreError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
