use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use atelier_core::generation::{GeneratedImage, GenerationRequest, Job, NewGeneratedImage};
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::{DbId, Timestamp};
use chrono::Utc;
use tokio::sync::RwLock;

use super::{RequestStore, StoreError, StoredImage, StoredRequest};

#[derive(Debug, Clone)]
struct RequestRecord {
    user_id: DbId,
    id: DbId,
    created_at: Timestamp,
    estimated_completion_date: Timestamp,
    status: RequestStatus,
    job: Job,
}

#[derive(Debug, Default)]
struct State {
    last_request_id: DbId,
    last_image_id: DbId,
    requests: BTreeMap<DbId, RequestRecord>,
    images: BTreeMap<DbId, StoredImage>,
}

impl State {
    fn images_of(&self, request_id: DbId) -> Vec<GeneratedImage> {
        self.images
            .values()
            .filter(|i| i.image.request_id == request_id)
            .map(|i| i.image.clone())
            .collect()
    }

    fn project(&self, record: &RequestRecord) -> StoredRequest {
        StoredRequest {
            user_id: record.user_id,
            request: GenerationRequest {
                id: record.id,
                created_at: record.created_at,
                estimated_completion_date: record.estimated_completion_date,
                status: record.status,
                job: record.job.clone(),
                images: self.images_of(record.id),
            },
        }
    }

    fn push_images(&mut self, request_id: DbId, user_id: DbId, images: &[NewGeneratedImage]) {
        for new in images {
            self.last_image_id += 1;
            let id = self.last_image_id;
            self.images.insert(
                id,
                StoredImage {
                    user_id,
                    image: GeneratedImage {
                        id,
                        hash: new.hash.clone(),
                        url: new.url.clone(),
                        available: new.available,
                        request_id,
                    },
                },
            );
        }
    }
}

/// In-process [`RequestStore`].
///
/// Ids are assigned monotonically from 1, like a `BIGSERIAL`. All writes
/// take a single lock, which gives the same compare-and-set guarantees as
/// the conditional `UPDATE`s of the PostgreSQL store.
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    /// (or succeed again when `false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn insert_request(
        &self,
        user_id: DbId,
        job: &Job,
        estimated_completion_at: Timestamp,
    ) -> Result<StoredRequest, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.last_request_id += 1;
        let record = RequestRecord {
            user_id,
            id: state.last_request_id,
            created_at: Utc::now(),
            estimated_completion_date: estimated_completion_at,
            status: RequestStatus::Pending,
            job: job.clone(),
        };
        let stored = state.project(&record);
        state.requests.insert(record.id, record);
        Ok(stored)
    }

    async fn find_request(&self, id: DbId) -> Result<Option<StoredRequest>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.requests.get(&id).map(|r| state.project(r)))
    }

    async fn list_requests(
        &self,
        user_id: DbId,
        cursor: Option<DbId>,
        limit: i64,
    ) -> Result<Vec<StoredRequest>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let upper = cursor.unwrap_or(DbId::MAX);
        Ok(state
            .requests
            .range(..upper)
            .rev()
            .map(|(_, r)| r)
            .filter(|r| r.user_id == user_id)
            .take(usize::try_from(limit.max(0)).unwrap_or(usize::MAX))
            .map(|r| state.project(r))
            .collect())
    }

    async fn transition_request(
        &self,
        id: DbId,
        from: RequestStatus,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let Some(record) = state.requests.get(&id) else {
            return Ok(None);
        };
        if record.status != from {
            return Ok(None);
        }
        if to == RequestStatus::Succeeded && images.is_empty() && state.images_of(id).is_empty() {
            return Ok(None);
        }

        let user_id = record.user_id;
        state.push_images(id, user_id, images);
        let Some(record) = state.requests.get_mut(&id) else {
            return Ok(None);
        };
        record.status = to;
        let record = record.clone();
        Ok(Some(state.project(&record)))
    }

    async fn attach_images(
        &self,
        id: DbId,
        expected: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let Some(record) = state.requests.get(&id).cloned() else {
            return Ok(None);
        };
        if record.status != expected {
            return Ok(None);
        }
        state.push_images(id, record.user_id, images);
        Ok(Some(state.project(&record)))
    }

    async fn mark_image_available(
        &self,
        image_id: DbId,
    ) -> Result<Option<StoredImage>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        Ok(state.images.get_mut(&image_id).map(|stored| {
            stored.image.available = true;
            stored.clone()
        }))
    }

    async fn find_images(&self, ids: &[DbId]) -> Result<Vec<StoredImage>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.images.get(id).cloned())
            .collect())
    }

    async fn delete_request(&self, id: DbId) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let existed = state.requests.remove(&id).is_some();
        state.images.retain(|_, i| i.image.request_id != id);
        Ok(existed)
    }

    async fn delete_images(&self, ids: &[DbId]) -> Result<Option<u64>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let doomed: BTreeSet<DbId> = ids
            .iter()
            .copied()
            .filter(|id| state.images.contains_key(id))
            .collect();
        let touched: BTreeSet<DbId> = doomed
            .iter()
            .filter_map(|id| state.images.get(id))
            .map(|i| i.image.request_id)
            .collect();
        let emptied = touched.iter().any(|request_id| {
            state
                .requests
                .get(request_id)
                .is_some_and(|r| r.status == RequestStatus::Succeeded)
                && state
                    .images_of(*request_id)
                    .iter()
                    .all(|i| doomed.contains(&i.id))
        });
        if emptied {
            return Ok(None);
        }
        for id in &doomed {
            state.images.remove(id);
        }
        Ok(Some(doomed.len() as u64))
    }

    async fn list_pending(&self) -> Result<Vec<StoredRequest>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .map(|r| state.project(r))
            .collect())
    }

    async fn count_active_at_or_above(&self, priority: i32) -> Result<i64, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let count = state
            .requests
            .values()
            .filter(|r| !r.status.is_terminal() && r.job.priority >= priority)
            .count();
        Ok(count as i64)
    }
}
