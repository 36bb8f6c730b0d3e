use std::collections::HashMap;

use async_trait::async_trait;
use atelier_core::generation::{GeneratedImage, Job, NewGeneratedImage};
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::{DbId, Timestamp};

use super::{RequestStore, StoreError, StoredImage, StoredRequest};
use crate::models::generated_image::GeneratedImageRow;
use crate::models::generation_request::GenerationRequestRow;
use crate::repositories::{GeneratedImageRepo, GenerationRequestRepo};
use crate::DbPool;

/// [`RequestStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgRequestStore {
    pool: DbPool,
}

impl PgRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode(
    found: Option<(GenerationRequestRow, Vec<GeneratedImageRow>)>,
) -> Result<Option<StoredRequest>, StoreError> {
    found
        .map(|(row, images)| {
            row.into_stored(images.into_iter().map(GeneratedImageRow::into_image).collect())
        })
        .transpose()
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn insert_request(
        &self,
        user_id: DbId,
        job: &Job,
        estimated_completion_at: Timestamp,
    ) -> Result<StoredRequest, StoreError> {
        let payload = serde_json::to_value(job)
            .map_err(|e| StoreError::Corrupt(format!("job payload: {e}")))?;
        let row = GenerationRequestRepo::insert(
            &self.pool,
            user_id,
            job.priority,
            job.quantity,
            &payload,
            estimated_completion_at,
        )
        .await?;
        row.into_stored(Vec::new())
    }

    async fn find_request(&self, id: DbId) -> Result<Option<StoredRequest>, StoreError> {
        let Some(row) = GenerationRequestRepo::find_by_id(&self.pool, id).await? else {
            return Ok(None);
        };
        let images = GeneratedImageRepo::list_for_requests(&self.pool, &[id])
            .await?
            .into_iter()
            .map(GeneratedImageRow::into_image)
            .collect();
        row.into_stored(images).map(Some)
    }

    async fn list_requests(
        &self,
        user_id: DbId,
        cursor: Option<DbId>,
        limit: i64,
    ) -> Result<Vec<StoredRequest>, StoreError> {
        let rows = GenerationRequestRepo::list_by_user(&self.pool, user_id, cursor, limit).await?;
        let ids: Vec<DbId> = rows.iter().map(|r| r.id).collect();

        let mut images: HashMap<DbId, Vec<GeneratedImage>> = HashMap::new();
        for image in GeneratedImageRepo::list_for_requests(&self.pool, &ids).await? {
            images
                .entry(image.request_id)
                .or_default()
                .push(image.into_image());
        }

        rows.into_iter()
            .map(|row| {
                let own = images.remove(&row.id).unwrap_or_default();
                row.into_stored(own)
            })
            .collect()
    }

    async fn transition_request(
        &self,
        id: DbId,
        from: RequestStatus,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        decode(GenerationRequestRepo::transition(&self.pool, id, from, to, images).await?)
    }

    async fn attach_images(
        &self,
        id: DbId,
        expected: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        decode(GenerationRequestRepo::attach_images(&self.pool, id, expected, images).await?)
    }

    async fn mark_image_available(
        &self,
        image_id: DbId,
    ) -> Result<Option<StoredImage>, StoreError> {
        Ok(GeneratedImageRepo::mark_available(&self.pool, image_id)
            .await?
            .map(GeneratedImageRow::into_stored))
    }

    async fn find_images(&self, ids: &[DbId]) -> Result<Vec<StoredImage>, StoreError> {
        Ok(GeneratedImageRepo::find_by_ids(&self.pool, ids)
            .await?
            .into_iter()
            .map(GeneratedImageRow::into_stored)
            .collect())
    }

    async fn delete_request(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(GenerationRequestRepo::delete(&self.pool, id).await?)
    }

    async fn delete_images(&self, ids: &[DbId]) -> Result<Option<u64>, StoreError> {
        Ok(GeneratedImageRepo::delete_many(&self.pool, ids).await?)
    }

    async fn list_pending(&self) -> Result<Vec<StoredRequest>, StoreError> {
        let rows = GenerationRequestRepo::list_by_status(&self.pool, RequestStatus::Pending).await?;
        // Pending requests have no images yet.
        rows.into_iter().map(|row| row.into_stored(Vec::new())).collect()
    }

    async fn count_active_at_or_above(&self, priority: i32) -> Result<i64, StoreError> {
        Ok(GenerationRequestRepo::count_active_at_or_above(&self.pool, priority).await?)
    }
}
