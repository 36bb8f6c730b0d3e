//! Repository for the `generation_requests` table.
//!
//! Status changes are compare-and-set: every `UPDATE` is conditioned on the
//! status the caller observed, so two racing writers can never both win.

use atelier_core::generation::NewGeneratedImage;
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::generated_image::GeneratedImageRow;
use crate::models::generation_request::GenerationRequestRow;
use crate::repositories::GeneratedImageRepo;

/// Column list for `generation_requests` queries.
const COLUMNS: &str = "\
    id, user_id, status_id, priority, quantity, job, \
    estimated_completion_at, created_at, updated_at";

/// Statuses that still occupy a place in the worker queue.
const ACTIVE_STATUSES: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Processing];

/// Provides persistence for generation requests.
pub struct GenerationRequestRepo;

impl GenerationRequestRepo {
    /// Insert a new `Pending` request.
    pub async fn insert(
        pool: &PgPool,
        user_id: DbId,
        priority: i32,
        quantity: i32,
        job: &serde_json::Value,
        estimated_completion_at: Timestamp,
    ) -> Result<GenerationRequestRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO generation_requests \
                 (user_id, status_id, priority, quantity, job, estimated_completion_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(user_id)
            .bind(RequestStatus::Pending.id())
            .bind(priority)
            .bind(quantity)
            .bind(job)
            .bind(estimated_completion_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<GenerationRequestRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_requests WHERE id = $1");
        sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List a user's requests newest first, strictly below `cursor` when given.
    ///
    /// Keyset pagination on `id` keeps pages stable while new requests are
    /// being inserted at the head.
    pub async fn list_by_user(
        pool: &PgPool,
        user_id: DbId,
        cursor: Option<DbId>,
        limit: i64,
    ) -> Result<Vec<GenerationRequestRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_requests \
             WHERE user_id = $1 AND ($2::BIGINT IS NULL OR id < $2) \
             ORDER BY id DESC \
             LIMIT $3"
        );
        sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(user_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Every request currently in `status`, oldest first.
    pub async fn list_by_status(
        pool: &PgPool,
        status: RequestStatus,
    ) -> Result<Vec<GenerationRequestRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_requests WHERE status_id = $1 ORDER BY id ASC"
        );
        sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(status.id())
            .fetch_all(pool)
            .await
    }

    /// Move a request from `from` to `to` and attach `images`, atomically.
    ///
    /// Returns `None` when the request is missing or no longer in `from`.
    /// A move to `Succeeded` also requires at least one image, either already
    /// attached or supplied here; otherwise nothing is written and `None`
    /// is returned.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: RequestStatus,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<(GenerationRequestRow, Vec<GeneratedImageRow>)>, sqlx::Error> {
        let images_satisfied = to != RequestStatus::Succeeded || !images.is_empty();

        let mut tx = pool.begin().await?;
        let query = format!(
            "UPDATE generation_requests \
             SET status_id = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id = $2 \
               AND ($4 OR EXISTS (SELECT 1 FROM generated_images WHERE request_id = $1)) \
             RETURNING {COLUMNS}"
        );
        let Some(row) = sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(id)
            .bind(from.id())
            .bind(to.id())
            .bind(images_satisfied)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        GeneratedImageRepo::insert_many(&mut *tx, row.id, row.user_id, images).await?;
        let image_rows = GeneratedImageRepo::list_for_request(&mut *tx, row.id).await?;
        tx.commit().await?;
        Ok(Some((row, image_rows)))
    }

    /// Attach images to a request that is still in `expected`.
    ///
    /// The request row is locked for the duration so a concurrent status
    /// change cannot slip in between the check and the insert.
    pub async fn attach_images(
        pool: &PgPool,
        id: DbId,
        expected: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<(GenerationRequestRow, Vec<GeneratedImageRow>)>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let query = format!(
            "UPDATE generation_requests \
             SET updated_at = NOW() \
             WHERE id = $1 AND status_id = $2 \
             RETURNING {COLUMNS}"
        );
        let Some(row) = sqlx::query_as::<_, GenerationRequestRow>(&query)
            .bind(id)
            .bind(expected.id())
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        GeneratedImageRepo::insert_many(&mut *tx, row.id, row.user_id, images).await?;
        let image_rows = GeneratedImageRepo::list_for_request(&mut *tx, row.id).await?;
        tx.commit().await?;
        Ok(Some((row, image_rows)))
    }

    /// Delete a request together with its images.
    ///
    /// Returns `true` if the request existed.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM generated_images WHERE request_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM generation_requests WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count active requests queued at `priority` or above.
    pub async fn count_active_at_or_above(
        pool: &PgPool,
        priority: i32,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM generation_requests \
             WHERE status_id IN ($1, $2) AND priority >= $3",
        )
        .bind(ACTIVE_STATUSES[0].id())
        .bind(ACTIVE_STATUSES[1].id())
        .bind(priority)
        .fetch_one(pool)
        .await
    }
}
