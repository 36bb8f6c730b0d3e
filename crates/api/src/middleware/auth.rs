//! Authentication extractors for Axum handlers.

use atelier_core::error::CoreError;
use atelier_core::roles::is_moderator_role;
use atelier_core::types::DbId;
use atelier_pipeline::Actor;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::auth::jwt::verify_user_token;
use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the shared worker secret.
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// Authenticated user extracted from a JWT Bearer token in the
/// `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: DbId,
    pub role: String,
}

impl AuthUser {
    pub fn is_moderator(&self) -> bool {
        is_moderator_role(&self.role)
    }

    /// The lifecycle-manager view of this caller.
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            is_moderator: self.is_moderator(),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        let claims = verify_user_token(token, &state.config.jwt).map_err(|_| {
            AppError::Core(CoreError::Unauthorized("Invalid or expired token".into()))
        })?;

        Ok(AuthUser {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

/// Marker extractor for worker-facing routes.
///
/// Succeeds only when `x-worker-token` equals the configured worker secret.
#[derive(Debug, Clone, Copy)]
pub struct WorkerAuth;

/// Compare two secrets without short-circuiting on the first differing byte.
fn secrets_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

impl FromRequestParts<AppState> for WorkerAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let given = parts
            .headers
            .get(WORKER_TOKEN_HEADER)
            .map(|v| v.as_bytes())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized("Missing worker token".into()))
            })?;

        if !secrets_match(given, state.config.worker_token.as_bytes()) {
            tracing::warn!("Rejected worker call with invalid token");
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid worker token".into(),
            )));
        }
        Ok(WorkerAuth)
    }
}
