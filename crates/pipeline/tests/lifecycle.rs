//! Request lifecycle scenarios against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use atelier_core::error::CoreError;
use atelier_core::generation::{ModelType, ResourceReference};
use atelier_core::scheduling::RequestStatus;
use atelier_db::store::RequestStore;
use atelier_events::GenerationEventKind;
use atelier_pipeline::dispatch::{DispatchQueue, WorkerDispatch};
use atelier_pipeline::Actor;

use common::*;

fn owner() -> Actor {
    Actor::user(OWNER)
}

async fn persisted_count(h: &Harness, user_id: i64) -> usize {
    h.store.list_requests(user_id, None, 100).await.unwrap().len()
}

/// Create a request and claim it so it is `Processing`.
async fn processing_request(h: &Harness) -> i64 {
    let created = h.service.create_request(&owner(), submission()).await.unwrap();
    let claimed = h
        .service
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, created.id);
    created.id
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_persists_pending_and_enqueues() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    assert_eq!(request.status, RequestStatus::Pending);
    assert!(request.images.is_empty());
    assert_eq!(request.job.quantity, 2);
    assert_eq!(request.job.model.id, CHECKPOINT_ID);
    assert!(request.job.additional_networks.contains_key(&LORA_ID));
    assert!(request.estimated_completion_date > request.created_at);
    assert_eq!(h.queue.len().await, 1);
}

#[tokio::test]
async fn invalid_quantity_is_rejected_and_nothing_persisted() {
    let h = harness();
    let mut input = submission();
    input.quantity = 0;

    let result = h.service.create_request(&owner(), input).await;
    assert_matches!(result, Err(CoreError::Validation(_)));
    assert_eq!(persisted_count(&h, OWNER).await, 0);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn non_positive_dimensions_are_rejected() {
    let h = harness();
    let mut input = submission();
    input.height = -1;
    assert_matches!(
        h.service.create_request(&owner(), input).await,
        Err(CoreError::Validation(_))
    );
    assert_eq!(persisted_count(&h, OWNER).await, 0);
}

#[tokio::test]
async fn uncovered_resource_is_capacity_unavailable() {
    let h = harness();
    let mut input = submission();
    // LoRA as a type is covered; this id is not.
    input
        .resources
        .push(ResourceReference::new(999, ModelType::Lora).with_strength(1.0));

    let result = h.service.create_request(&owner(), input).await;
    assert_matches!(result, Err(CoreError::CapacityUnavailable(msg)) if msg.contains("999"));
    assert_eq!(persisted_count(&h, OWNER).await, 0);
}

#[tokio::test]
async fn empty_coverage_rejects_everything() {
    let h = harness();
    h.coverage.replace(Default::default());
    assert_matches!(
        h.service.create_request(&owner(), submission()).await,
        Err(CoreError::CapacityUnavailable(_))
    );
}

#[tokio::test]
async fn elevated_priority_needs_moderator() {
    let h = harness();
    let mut input = submission();
    input.priority = Some(5);

    assert_matches!(
        h.service.create_request(&owner(), input.clone()).await,
        Err(CoreError::Validation(_))
    );
    let request = h
        .service
        .create_request(&Actor::moderator(MODERATOR), input)
        .await
        .unwrap();
    assert_eq!(request.job.priority, 5);
}

#[tokio::test]
async fn dispatch_failure_after_capacity_check_errors_request() {
    let h = refusing_harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    assert_eq!(request.status, RequestStatus::Error);
    let stored = h.store.find_request(request.id).await.unwrap().unwrap();
    assert_eq!(stored.request.status, RequestStatus::Error);
}

// ---------------------------------------------------------------------------
// Worker callbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_moves_request_to_processing() {
    let h = harness();
    let id = processing_request(&h).await;
    let request = h.service.get_request(&owner(), id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Processing);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn claim_on_empty_queue_returns_none() {
    let h = harness();
    assert!(h
        .service
        .claim_next_job(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn complete_attaches_images_and_succeeds() {
    let h = harness();
    let id = processing_request(&h).await;

    let done = h
        .service
        .complete_request(id, vec![image("a1"), image("b2")])
        .await
        .unwrap();
    assert_eq!(done.status, RequestStatus::Succeeded);
    assert_eq!(done.images.len(), 2);
    assert!(done.images.iter().all(|i| i.request_id == id));
}

#[tokio::test]
async fn succeeded_without_images_is_rejected() {
    let h = harness();
    let id = processing_request(&h).await;

    assert_matches!(
        h.service.update_status(id, RequestStatus::Succeeded).await,
        Err(CoreError::Validation(_))
    );
    assert_matches!(
        h.service.complete_request(id, vec![]).await,
        Err(CoreError::Validation(_))
    );
    let request = h.service.get_request(&owner(), id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Processing);
}

#[tokio::test]
async fn attached_images_allow_plain_success_update() {
    let h = harness();
    let id = processing_request(&h).await;

    let attached = h.service.attach_images(id, vec![image("a1")]).await.unwrap();
    assert_eq!(attached.images.len(), 1);

    let done = h
        .service
        .update_status(id, RequestStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(done.status, RequestStatus::Succeeded);
    assert_eq!(done.images.len(), 1);
}

#[tokio::test]
async fn attach_requires_processing() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();
    assert_matches!(
        h.service.attach_images(request.id, vec![image("a1")]).await,
        Err(CoreError::Validation(msg)) if msg.contains("Pending")
    );
}

#[tokio::test]
async fn illegal_transition_reports_current_and_changes_nothing() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    let result = h
        .service
        .update_status(request.id, RequestStatus::Succeeded)
        .await;
    assert_matches!(
        result,
        Err(CoreError::IllegalTransition {
            current: RequestStatus::Pending,
            requested: RequestStatus::Succeeded,
            ..
        })
    );
    let after = h.service.get_request(&owner(), request.id).await.unwrap();
    assert_eq!(after.status, RequestStatus::Pending);
}

#[tokio::test]
async fn terminal_requests_reject_further_updates() {
    let h = harness();
    let id = processing_request(&h).await;
    h.service
        .update_status(id, RequestStatus::Error)
        .await
        .unwrap();

    for to in [RequestStatus::Processing, RequestStatus::Succeeded, RequestStatus::Pending] {
        assert_matches!(
            h.service.update_status(id, to).await,
            Err(CoreError::IllegalTransition {
                current: RequestStatus::Error,
                ..
            })
        );
    }
}

#[tokio::test]
async fn update_status_on_missing_request_is_not_found() {
    let h = harness();
    assert_matches!(
        h.service.update_status(404, RequestStatus::Processing).await,
        Err(CoreError::NotFound { id: 404, .. })
    );
}

#[tokio::test]
async fn mark_image_available_is_idempotent() {
    let h = harness();
    let id = processing_request(&h).await;
    let done = h.service.complete_request(id, vec![image("a1")]).await.unwrap();
    let image_id = done.images[0].id;

    let first = h.service.mark_image_available(image_id).await.unwrap();
    let second = h.service.mark_image_available(image_id).await.unwrap();
    assert!(first.available);
    assert_eq!(first, second);

    assert_matches!(
        h.service.mark_image_available(9_999).await,
        Err(CoreError::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_twice_is_a_noop_the_second_time() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    let first = h.service.cancel_request(&owner(), request.id).await.unwrap();
    let second = h.service.cancel_request(&owner(), request.id).await.unwrap();
    assert_eq!(first.status, RequestStatus::Cancelled);
    assert_eq!(second, first);
}

#[tokio::test]
async fn cancelling_a_succeeded_request_reports_it_unchanged() {
    let h = harness();
    let id = processing_request(&h).await;
    h.service.complete_request(id, vec![image("a1")]).await.unwrap();

    let result = h.service.cancel_request(&owner(), id).await.unwrap();
    assert_eq!(result.status, RequestStatus::Succeeded);
}

#[tokio::test]
async fn cancelled_job_leaves_the_queue() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();
    h.service.cancel_request(&owner(), request.id).await.unwrap();

    assert!(h.queue.is_empty().await);
    assert!(h
        .service
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn claim_skips_jobs_whose_request_moved_on() {
    let h = harness();
    let first = h.service.create_request(&owner(), submission()).await.unwrap();
    let second = h.service.create_request(&owner(), submission()).await.unwrap();

    // Cancel behind the queue's back so the stale entry is still queued.
    h.store
        .transition_request(first.id, RequestStatus::Pending, RequestStatus::Cancelled, &[])
        .await
        .unwrap();

    let claimed = h
        .service
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, second.id);
}

#[tokio::test]
async fn cancelling_someone_elses_request_is_not_owner() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();
    assert_matches!(
        h.service.cancel_request(&Actor::user(OTHER_USER), request.id).await,
        Err(CoreError::NotOwner { .. })
    );
}

// ---------------------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_requeues_only_pending_requests() {
    let h = harness();
    let claimed = processing_request(&h).await;
    let waiting = h.service.create_request(&owner(), submission()).await.unwrap();
    let cancelled = h.service.create_request(&owner(), submission()).await.unwrap();
    h.service.cancel_request(&owner(), cancelled.id).await.unwrap();

    // A new process starts over the same store with an empty queue.
    let queue = Arc::new(DispatchQueue::default());
    let restarted = service_over(
        Arc::clone(&h.store) as Arc<dyn RequestStore>,
        Arc::clone(&queue) as Arc<dyn WorkerDispatch>,
        Arc::clone(&h.coverage),
        Arc::clone(&h.events),
    );
    assert_eq!(restarted.recover_pending().await.unwrap(), 1);
    assert_eq!(queue.len().await, 1);

    let next = restarted
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, waiting.id);
    assert_ne!(next.id, claimed);
    assert_eq!(next.status, RequestStatus::Processing);
}

#[tokio::test]
async fn restart_without_dispatch_fails_pending_requests() {
    let h = harness();
    let waiting = h.service.create_request(&owner(), submission()).await.unwrap();

    let restarted = service_over(
        Arc::clone(&h.store) as Arc<dyn RequestStore>,
        Arc::new(RefusingDispatch),
        Arc::clone(&h.coverage),
        Arc::clone(&h.events),
    );
    assert_eq!(restarted.recover_pending().await.unwrap(), 0);

    let after = h.service.get_request(&owner(), waiting.id).await.unwrap();
    assert_eq!(after.status, RequestStatus::Error);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_request_checks_ownership() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    assert_matches!(
        h.service.get_request(&Actor::user(OTHER_USER), request.id).await,
        Err(CoreError::NotOwner { .. })
    );
    assert!(h
        .service
        .get_request(&Actor::moderator(MODERATOR), request.id)
        .await
        .is_ok());
    assert_matches!(
        h.service.get_request(&owner(), 777).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn generation_data_resubmits_the_original_settings() {
    let h = harness();
    let id = processing_request(&h).await;
    let done = h
        .service
        .complete_request(id, vec![image("a1")])
        .await
        .unwrap();

    let from_request = h.service.get_generation_data(&owner(), id).await.unwrap();
    let from_image = h
        .service
        .get_image_generation_data(&owner(), done.images[0].id)
        .await
        .unwrap();
    assert_eq!(from_request, from_image);
    assert_eq!(from_request.prompt, submission().prompt);
    assert_eq!(from_request.resources.len(), 2);

    let again = h.service.create_request(&owner(), from_image).await.unwrap();
    assert_eq!(again.job.params, done.job.params);
    assert_eq!(again.job.additional_networks, done.job.additional_networks);
}

#[tokio::test]
async fn generation_data_checks_ownership_and_existence() {
    let h = harness();
    let id = processing_request(&h).await;
    let done = h
        .service
        .complete_request(id, vec![image("a1")])
        .await
        .unwrap();
    let image_id = done.images[0].id;

    assert_matches!(
        h.service
            .get_image_generation_data(&Actor::user(OTHER_USER), image_id)
            .await,
        Err(CoreError::NotOwner { .. })
    );
    assert_matches!(
        h.service.get_generation_data(&Actor::user(OTHER_USER), id).await,
        Err(CoreError::NotOwner { .. })
    );
    assert!(h
        .service
        .get_image_generation_data(&Actor::moderator(MODERATOR), image_id)
        .await
        .is_ok());
    assert_matches!(
        h.service.get_image_generation_data(&owner(), 98_765).await,
        Err(CoreError::NotFound { entity: "GeneratedImage", .. })
    );
}

#[tokio::test]
async fn get_requests_pages_newest_first() {
    let h = harness();
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.service.create_request(&owner(), submission()).await.unwrap().id);
    }
    h.service
        .create_request(&Actor::user(OTHER_USER), submission())
        .await
        .unwrap();

    let first = h.service.get_requests(&owner(), None, Some(2)).await.unwrap();
    assert_eq!(
        first.items.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ids[4], ids[3]]
    );
    assert_eq!(first.next_cursor, Some(ids[3]));

    let rest = h
        .service
        .get_requests(&owner(), first.next_cursor, Some(10))
        .await
        .unwrap();
    assert_eq!(
        rest.items.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ids[2], ids[1], ids[0]]
    );
    assert_eq!(rest.next_cursor, None);
}

#[tokio::test]
async fn coverage_check_explains_shortfall() {
    let h = harness();
    let ok = h.service.check_resources_coverage(
        &[ResourceReference::new(CHECKPOINT_ID, ModelType::Checkpoint)],
        "DDIM",
    );
    assert!(ok.available);
    assert_eq!(ok.reason, None);

    let missing = h.service.check_resources_coverage(
        &[ResourceReference::new(CHECKPOINT_ID, ModelType::Checkpoint)],
        "UniPC",
    );
    assert!(!missing.available);
    assert!(missing.reason.unwrap().contains("UniPC"));
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_request_removes_images_and_queue_entry() {
    let h = harness();
    let queued = h.service.create_request(&owner(), submission()).await.unwrap();
    h.service.delete_request(&owner(), queued.id).await.unwrap();
    assert!(h.queue.is_empty().await);

    let id = processing_request(&h).await;
    let done = h.service.complete_request(id, vec![image("a1")]).await.unwrap();
    h.service.delete_request(&owner(), id).await.unwrap();

    assert!(h.store.find_images(&[done.images[0].id]).await.unwrap().is_empty());
    assert_matches!(
        h.service.delete_request(&owner(), id).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn moderators_may_delete_any_request() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();
    assert_matches!(
        h.service.delete_request(&Actor::user(OTHER_USER), request.id).await,
        Err(CoreError::NotOwner { .. })
    );
    h.service
        .delete_request(&Actor::moderator(MODERATOR), request.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_image_checks_ownership() {
    let h = harness();
    let id = processing_request(&h).await;
    let done = h
        .service
        .complete_request(id, vec![image("a1"), image("a2")])
        .await
        .unwrap();
    let image_id = done.images[0].id;

    assert_matches!(
        h.service.delete_image(&Actor::user(OTHER_USER), image_id).await,
        Err(CoreError::NotOwner { .. })
    );
    h.service.delete_image(&owner(), image_id).await.unwrap();
    assert_matches!(
        h.service.delete_image(&owner(), image_id).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn bulk_delete_is_all_or_nothing() {
    let h = harness();
    let mine = processing_request(&h).await;
    let mine = h
        .service
        .complete_request(mine, vec![image("a1"), image("a2"), image("a3")])
        .await
        .unwrap();

    let theirs = h
        .service
        .create_request(&Actor::user(OTHER_USER), submission())
        .await
        .unwrap();
    h.service.claim_next_job(Duration::ZERO).await.unwrap();
    let theirs = h
        .service
        .complete_request(theirs.id, vec![image("b1")])
        .await
        .unwrap();

    let my_ids: Vec<i64> = mine.images[..2].iter().map(|i| i.id).collect();

    // A missing id aborts the whole batch.
    let mut with_missing = my_ids.clone();
    with_missing.push(55_555);
    assert_matches!(
        h.service.bulk_delete_images(&owner(), &with_missing).await,
        Err(CoreError::NotFound { id: 55_555, .. })
    );

    // A foreign id aborts the whole batch.
    let mut with_foreign = my_ids.clone();
    with_foreign.push(theirs.images[0].id);
    assert_matches!(
        h.service.bulk_delete_images(&owner(), &with_foreign).await,
        Err(CoreError::NotOwner { .. })
    );
    assert_eq!(h.store.find_images(&my_ids).await.unwrap().len(), 2);

    assert_eq!(h.service.bulk_delete_images(&owner(), &my_ids).await.unwrap(), 2);
    assert!(h.store.find_images(&my_ids).await.unwrap().is_empty());
}

#[tokio::test]
async fn succeeded_request_keeps_its_last_image() {
    let h = harness();
    let id = processing_request(&h).await;
    let done = h
        .service
        .complete_request(id, vec![image("a1"), image("a2")])
        .await
        .unwrap();
    let ids: Vec<i64> = done.images.iter().map(|i| i.id).collect();

    assert_matches!(
        h.service.bulk_delete_images(&owner(), &ids).await,
        Err(CoreError::Validation(_))
    );
    h.service.delete_image(&owner(), ids[0]).await.unwrap();
    assert_matches!(
        h.service.delete_image(&owner(), ids[1]).await,
        Err(CoreError::Validation(_))
    );

    let request = h.service.get_request(&owner(), id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Succeeded);
    assert_eq!(request.images.len(), 1);
}

#[tokio::test]
async fn bulk_delete_requires_ids() {
    let h = harness();
    assert_matches!(
        h.service.bulk_delete_images(&owner(), &[]).await,
        Err(CoreError::Validation(_))
    );
}

// ---------------------------------------------------------------------------
// Storage failures and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn storage_failures_surface_as_storage_unavailable() {
    let h = harness();
    let request = h.service.create_request(&owner(), submission()).await.unwrap();

    h.store.set_unavailable(true);
    assert_matches!(
        h.service.create_request(&owner(), submission()).await,
        Err(CoreError::StorageUnavailable(_))
    );
    assert_matches!(
        h.service.cancel_request(&owner(), request.id).await,
        Err(CoreError::StorageUnavailable(_))
    );

    h.store.set_unavailable(false);
    let after = h.service.get_request(&owner(), request.id).await.unwrap();
    assert_eq!(after.status, RequestStatus::Pending);
}

#[tokio::test]
async fn storage_failure_during_claim_requeues_job() {
    let h = harness();
    h.service.create_request(&owner(), submission()).await.unwrap();

    h.store.set_unavailable(true);
    assert_matches!(
        h.service.claim_next_job(Duration::ZERO).await,
        Err(CoreError::StorageUnavailable(_))
    );
    h.store.set_unavailable(false);

    assert_eq!(h.queue.len().await, 1);
    let claimed = h
        .service
        .claim_next_job(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, RequestStatus::Processing);
}

#[tokio::test]
async fn lifecycle_mutations_publish_events() {
    let h = harness();
    let mut rx = h.events.subscribe();

    let id = processing_request(&h).await;
    h.service.complete_request(id, vec![image("a1")]).await.unwrap();

    let kinds: Vec<GenerationEventKind> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
    assert_eq!(
        kinds,
        vec![
            GenerationEventKind::RequestCreated,
            GenerationEventKind::StatusChanged,
            GenerationEventKind::StatusChanged,
        ]
    );
    let last = h.service.get_request(&owner(), id).await.unwrap();
    assert_eq!(last.status, RequestStatus::Succeeded);
}
