//! Racing callers against one service instance.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::error::CoreError;
use atelier_core::generation::{Job, NewGeneratedImage};
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::{DbId, Timestamp};
use atelier_db::store::{
    MemoryRequestStore, RequestStore, StoreError, StoredImage, StoredRequest,
};
use atelier_events::EventBus;
use atelier_pipeline::coverage_index::CoverageIndex;
use atelier_pipeline::dispatch::{DispatchQueue, WorkerDispatch};
use atelier_pipeline::Actor;

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callbacks_out_of_processing_have_one_winner() {
    for _ in 0..20 {
        let h = harness();
        let created = h
            .service
            .create_request(&Actor::user(OWNER), submission())
            .await
            .unwrap();
        h.service.claim_next_job(Duration::ZERO).await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..8 {
            let service = Arc::clone(&h.service);
            let id = created.id;
            tasks.push(tokio::spawn(async move {
                if n % 2 == 0 {
                    service.update_status(id, RequestStatus::Error).await
                } else {
                    service
                        .complete_request(id, vec![image(&format!("h{n}"))])
                        .await
                }
            }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(request) => winners.push(request),
                Err(CoreError::IllegalTransition { current, .. }) => {
                    assert!(current.is_terminal());
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners.len(), 1, "exactly one callback may leave Processing");

        let final_state = h
            .service
            .get_request(&Actor::user(OWNER), created.id)
            .await
            .unwrap();
        assert_eq!(final_state.status, winners[0].status);
        // Only the winning completion's images are stored.
        let expected_images = usize::from(final_state.status == RequestStatus::Succeeded);
        assert_eq!(final_state.images.len(), expected_images);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claims_hand_each_job_out_once() {
    let h = harness();
    for _ in 0..10 {
        h.service
            .create_request(&Actor::user(OWNER), submission())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            service.claim_next_job(Duration::from_millis(20)).await
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(request) = task.await.unwrap().unwrap() {
            claimed.push(request.id);
        }
    }
    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 10);
    assert_eq!(unique.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_get_distinct_ids() {
    let h = harness();
    let mut tasks = Vec::new();
    for user in 0..25 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            service
                .create_request(&Actor::user(user % 3 + 1), submission())
                .await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        assert!(ids.insert(task.await.unwrap().unwrap().id));
    }
    assert_eq!(ids.len(), 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cursor_walk_survives_concurrent_inserts() {
    let h = harness();
    let mut initial = Vec::new();
    for _ in 0..30 {
        initial.push(
            h.service
                .create_request(&Actor::user(OWNER), submission())
                .await
                .unwrap()
                .id,
        );
    }

    let writer = {
        let service = Arc::clone(&h.service);
        tokio::spawn(async move {
            for _ in 0..20 {
                service
                    .create_request(&Actor::user(OWNER), submission())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = h
            .service
            .get_requests(&Actor::user(OWNER), cursor, Some(7))
            .await
            .unwrap();
        seen.extend(page.items.iter().map(|r| r.id));
        tokio::task::yield_now().await;
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    writer.await.unwrap();

    assert!(
        seen.windows(2).all(|w| w[0] > w[1]),
        "ids must be strictly decreasing with no repeats"
    );
    let seen: HashSet<_> = seen.into_iter().collect();
    for id in initial {
        assert!(seen.contains(&id), "request {id} was skipped");
    }
}

/// Memory store whose status writes hang while `stalled` is set.
#[derive(Default)]
struct StallingStore {
    inner: MemoryRequestStore,
    stalled: AtomicBool,
}

#[async_trait]
impl RequestStore for StallingStore {
    async fn insert_request(
        &self,
        user_id: DbId,
        job: &Job,
        estimated_completion_at: Timestamp,
    ) -> Result<StoredRequest, StoreError> {
        self.inner.insert_request(user_id, job, estimated_completion_at).await
    }

    async fn find_request(&self, id: DbId) -> Result<Option<StoredRequest>, StoreError> {
        self.inner.find_request(id).await
    }

    async fn list_requests(
        &self,
        user_id: DbId,
        cursor: Option<DbId>,
        limit: i64,
    ) -> Result<Vec<StoredRequest>, StoreError> {
        self.inner.list_requests(user_id, cursor, limit).await
    }

    async fn transition_request(
        &self,
        id: DbId,
        from: RequestStatus,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.transition_request(id, from, to, images).await
    }

    async fn attach_images(
        &self,
        id: DbId,
        expected: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Option<StoredRequest>, StoreError> {
        self.inner.attach_images(id, expected, images).await
    }

    async fn mark_image_available(
        &self,
        image_id: DbId,
    ) -> Result<Option<StoredImage>, StoreError> {
        self.inner.mark_image_available(image_id).await
    }

    async fn find_images(&self, ids: &[DbId]) -> Result<Vec<StoredImage>, StoreError> {
        self.inner.find_images(ids).await
    }

    async fn delete_request(&self, id: DbId) -> Result<bool, StoreError> {
        self.inner.delete_request(id).await
    }

    async fn delete_images(&self, ids: &[DbId]) -> Result<Option<u64>, StoreError> {
        self.inner.delete_images(ids).await
    }

    async fn list_pending(&self) -> Result<Vec<StoredRequest>, StoreError> {
        self.inner.list_pending().await
    }

    async fn count_active_at_or_above(&self, priority: i32) -> Result<i64, StoreError> {
        self.inner.count_active_at_or_above(priority).await
    }
}

#[tokio::test]
async fn abandoned_claim_puts_its_job_back() {
    let store = Arc::new(StallingStore::default());
    let queue = Arc::new(DispatchQueue::default());
    let service = service_over(
        Arc::clone(&store) as Arc<dyn RequestStore>,
        Arc::clone(&queue) as Arc<dyn WorkerDispatch>,
        Arc::new(CoverageIndex::new(covered_fleet())),
        Arc::new(EventBus::default()),
    );
    let created = service
        .create_request(&Actor::user(OWNER), submission())
        .await
        .unwrap();

    // The caller gives up while the status write is still in flight.
    store.stalled.store(true, Ordering::SeqCst);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), service.claim_next_job(Duration::ZERO))
            .await;
    assert!(abandoned.is_err());
    store.stalled.store(false, Ordering::SeqCst);

    // The job goes back on a spawned task.
    for _ in 0..100 {
        if !queue.is_empty().await {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(queue.len().await, 1);

    let claimed = service
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, created.id);
    assert_eq!(claimed.status, RequestStatus::Processing);
}
