//! Repository for the `generated_images` table.

use atelier_core::generation::NewGeneratedImage;
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::generated_image::GeneratedImageRow;

/// Column list for `generated_images` queries.
const COLUMNS: &str = "id, request_id, user_id, hash, url, available, created_at, updated_at";

/// Provides image persistence. Inserts run on a caller-owned connection so
/// they share the transaction of the status change that produced them.
pub struct GeneratedImageRepo;

impl GeneratedImageRepo {
    /// Insert worker-reported images for a request.
    pub async fn insert_many(
        conn: &mut PgConnection,
        request_id: DbId,
        user_id: DbId,
        images: &[NewGeneratedImage],
    ) -> Result<(), sqlx::Error> {
        for image in images {
            sqlx::query(
                "INSERT INTO generated_images (request_id, user_id, hash, url, available) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(request_id)
            .bind(user_id)
            .bind(&image.hash)
            .bind(&image.url)
            .bind(image.available)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// List the images of one request on a caller-owned connection.
    pub async fn list_for_request(
        conn: &mut PgConnection,
        request_id: DbId,
    ) -> Result<Vec<GeneratedImageRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generated_images WHERE request_id = $1 ORDER BY id ASC"
        );
        sqlx::query_as::<_, GeneratedImageRow>(&query)
            .bind(request_id)
            .fetch_all(&mut *conn)
            .await
    }

    /// List the images of several requests in one round trip.
    pub async fn list_for_requests(
        pool: &PgPool,
        request_ids: &[DbId],
    ) -> Result<Vec<GeneratedImageRow>, sqlx::Error> {
        if request_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {COLUMNS} FROM generated_images \
             WHERE request_id = ANY($1) \
             ORDER BY request_id, id ASC"
        );
        sqlx::query_as::<_, GeneratedImageRow>(&query)
            .bind(request_ids)
            .fetch_all(pool)
            .await
    }

    /// Find images by id. Missing ids are simply absent from the result.
    pub async fn find_by_ids(
        pool: &PgPool,
        ids: &[DbId],
    ) -> Result<Vec<GeneratedImageRow>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!("SELECT {COLUMNS} FROM generated_images WHERE id = ANY($1)");
        sqlx::query_as::<_, GeneratedImageRow>(&query)
            .bind(ids)
            .fetch_all(pool)
            .await
    }

    /// Flag an image as available. Re-marking an available image is a no-op
    /// that still returns the row.
    pub async fn mark_available(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<GeneratedImageRow>, sqlx::Error> {
        let query = format!(
            "UPDATE generated_images \
             SET available = TRUE, \
                 updated_at = CASE WHEN available THEN updated_at ELSE NOW() END \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GeneratedImageRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Delete images by id.
    ///
    /// Runs in one transaction and rolls back, returning `None`, if the
    /// delete would leave a `Succeeded` request with no image at all.
    /// Otherwise returns the number of rows removed.
    pub async fn delete_many(pool: &PgPool, ids: &[DbId]) -> Result<Option<u64>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Some(0));
        }
        let mut tx = pool.begin().await?;
        let touched: Vec<DbId> = sqlx::query_scalar(
            "DELETE FROM generated_images WHERE id = ANY($1) RETURNING request_id",
        )
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;

        let emptied: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM generation_requests r \
             WHERE r.id = ANY($1) AND r.status_id = $2 \
               AND NOT EXISTS (SELECT 1 FROM generated_images i WHERE i.request_id = r.id)",
        )
        .bind(&touched)
        .bind(RequestStatus::Succeeded.id())
        .fetch_one(&mut *tx)
        .await?;
        if emptied > 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(touched.len() as u64))
    }
}
