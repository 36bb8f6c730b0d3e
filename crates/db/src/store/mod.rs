//! The storage seam used by the request lifecycle manager.
//!
//! [`RequestStore`] is implemented by [`PgRequestStore`] for production and
//! by [`MemoryRequestStore`] for tests and database-less local runs. Both
//! honour the same contract:
//!
//! - Status changes are compare-and-set on the status the caller observed.
//! - A `Succeeded` request always has at least one image.
//! - Listing is newest-first with an exclusive id cursor.

use async_trait::async_trait;
use atelier_core::generation::{GeneratedImage, GenerationRequest, Job, NewGeneratedImage};
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::{DbId, Timestamp};

mod memory;
mod postgres;

pub use memory::MemoryRequestStore;
pub use postgres::PgRequestStore;

/// Errors surfaced by a [`RequestStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// A request together with the id of the user who owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    pub user_id: DbId,
    pub request: GenerationRequest,
}

/// An image together with the id of the user who owns its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub user_id: DbId,
    pub image: GeneratedImage,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new `Pending` request for `user_id`.
    async fn insert_request(
        &self,
        user_id: DbId,
        job: &Job,
        estimated_completion_at: Timestamp,
    ) -> Result<StoredRequest, StoreError>;

    async fn find_request(&self, id: DbId) -> Result<Option<StoredRequest>, StoreError>;

    /// Up to `limit` of the user's requests with id below `cursor`, newest
    /// first.
    async fn list_requests(
        &self,
        user_id: DbId,
        cursor: Option<DbId>,
        limit: i64,
    ) -> Result<Vec<StoredRequest>, StoreError>;

    /// Compare-and-set the status from `from` to `to`, attaching `images` in
    /// the same write.
    ///
    /// Returns `None` if the request is missing, is no longer in `from`, or
    /// would become `Succeeded` without any image.
    async fn transition_request(
        &self,
        id: DbId,
        from: RequestStatus,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError>;

    /// Attach images while the request is in `expected`.
    ///
    /// Returns `None` if the request is missing or in another status.
    async fn attach_images(
        &self,
        id: DbId,
        expected: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError>;

    /// Flag an image as available. Idempotent.
    async fn mark_image_available(&self, image_id: DbId)
        -> Result<Option<StoredImage>, StoreError>;

    /// Look up images by id; unknown ids are omitted.
    async fn find_images(&self, ids: &[DbId]) -> Result<Vec<StoredImage>, StoreError>;

    /// Delete a request and its images. Returns `false` if it did not exist.
    async fn delete_request(&self, id: DbId) -> Result<bool, StoreError>;

    /// Delete images by id, all in one write.
    ///
    /// Returns `None`, deleting nothing, if the write would leave a
    /// `Succeeded` request without any image. Otherwise returns the number
    /// removed.
    async fn delete_images(&self, ids: &[DbId]) -> Result<Option<u64>, StoreError>;

    /// Every `Pending` request, oldest first.
    async fn list_pending(&self) -> Result<Vec<StoredRequest>, StoreError>;

    /// Count `Pending` and `Processing` requests with priority `>= priority`.
    async fn count_active_at_or_above(&self, priority: i32) -> Result<i64, StoreError>;
}
