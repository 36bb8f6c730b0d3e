//! Generation request rows.

use atelier_core::generation::{GeneratedImage, GenerationRequest, Job};
use atelier_core::scheduling::{RequestStatus, StatusId};
use atelier_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use crate::store::{StoreError, StoredRequest};

/// A row from the `generation_requests` table.
///
/// `job` holds the serialized [`Job`]; `priority` and `quantity` are copied
/// out of it so queue-depth queries do not have to reach into JSONB.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationRequestRow {
    pub id: DbId,
    pub user_id: DbId,
    pub status_id: StatusId,
    pub priority: i32,
    pub quantity: i32,
    pub job: serde_json::Value,
    pub estimated_completion_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GenerationRequestRow {
    /// Decode the row into its domain projection with the given images.
    ///
    /// Fails with [`StoreError::Corrupt`] when the status id is unknown or the
    /// job payload no longer deserializes.
    pub fn into_stored(self, images: Vec<GeneratedImage>) -> Result<StoredRequest, StoreError> {
        let status = RequestStatus::from_id(self.status_id).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "generation request {} has unknown status id {}",
                self.id, self.status_id
            ))
        })?;
        let job: Job = serde_json::from_value(self.job).map_err(|e| {
            StoreError::Corrupt(format!("generation request {} job payload: {e}", self.id))
        })?;

        Ok(StoredRequest {
            user_id: self.user_id,
            request: GenerationRequest {
                id: self.id,
                created_at: self.created_at,
                estimated_completion_date: self.estimated_completion_at,
                status,
                job,
                images,
            },
        })
    }
}
