//! The request lifecycle manager.
//!
//! [`GenerationService`] owns every status change of a generation request.
//! Writes go through the store's compare-and-set primitives; a caller that
//! loses a race re-reads the request and re-validates against the status it
//! now finds, so two racing callbacks can never both leave `Processing`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use atelier_core::coverage::Coverage;
use atelier_core::error::CoreError;
use atelier_core::generation::{
    validate_new_image, CreateGenerationRequest, GeneratedImage, GenerationRequest,
    NewGeneratedImage, ResourceReference,
};
use atelier_core::scheduling::{state_machine, RequestStatus};
use atelier_core::types::DbId;
use atelier_db::store::{RequestStore, StoreError, StoredRequest};
use atelier_events::{EventBus, GenerationEvent, GenerationEventKind};
use chrono::Utc;
use serde::Serialize;

use crate::coverage_index::CoverageIndex;
use crate::dispatch::{QueuedJob, WorkerDispatch};
use crate::estimator::CompletionEstimator;

/// Default page size for request listing.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Maximum page size for request listing.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Compare-and-set attempts before giving up. Statuses only move forward,
/// so an honest race settles within two re-reads.
const MAX_TRANSITION_ATTEMPTS: usize = 4;

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: DbId,
    /// Moderators may raise priority and bypass ownership checks.
    pub is_moderator: bool,
}

impl Actor {
    pub fn user(user_id: DbId) -> Self {
        Self {
            user_id,
            is_moderator: false,
        }
    }

    pub fn moderator(user_id: DbId) -> Self {
        Self {
            user_id,
            is_moderator: true,
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as `cursor` to fetch the next page. `None` on the last page.
    pub next_cursor: Option<DbId>,
}

/// Outcome of a coverage pre-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageCheck {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Clamp a requested page size to `1..=MAX_PAGE_LIMIT`, defaulting to
/// `DEFAULT_PAGE_LIMIT`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

fn storage(err: StoreError) -> CoreError {
    CoreError::StorageUnavailable(err.to_string())
}

fn ensure_owner(actor: &Actor, entity: &'static str, id: DbId, owner: DbId) -> Result<(), CoreError> {
    if owner != actor.user_id && !actor.is_moderator {
        return Err(CoreError::NotOwner { entity, id });
    }
    Ok(())
}

fn validate_images(images: &[NewGeneratedImage]) -> Result<(), CoreError> {
    if images.is_empty() {
        return Err(CoreError::Validation(
            "at least one image is required".to_string(),
        ));
    }
    images.iter().try_for_each(validate_new_image)
}

/// Result of a transition attempt.
enum Transition {
    Applied(StoredRequest),
    /// Cancellation of an already-terminal request.
    Unchanged(StoredRequest),
}

/// Holds a job popped from the dispatcher until its claim settles.
///
/// Dropped while still armed, it puts the job back on a spawned task. A
/// duplicate entry is harmless: claiming it loses the `Pending` compare-and-
/// set and is skipped.
struct RequeueOnDrop {
    dispatch: Arc<dyn WorkerDispatch>,
    job: Option<QueuedJob>,
}

impl RequeueOnDrop {
    fn new(dispatch: Arc<dyn WorkerDispatch>, job: QueuedJob) -> Self {
        Self {
            dispatch,
            job: Some(job),
        }
    }

    fn disarm(mut self) {
        self.job = None;
    }

    /// Put the job back now, staying armed until the enqueue has landed.
    async fn requeue(mut self) {
        if let Some(queued) = &self.job {
            if let Err(e) = self.dispatch.enqueue(queued.request_id, &queued.job).await {
                tracing::error!(request_id = queued.request_id, error = %e, "Failed to requeue job");
            }
        }
        self.job = None;
    }
}

impl Drop for RequeueOnDrop {
    fn drop(&mut self) {
        let Some(queued) = self.job.take() else {
            return;
        };
        let request_id = queued.request_id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(request_id, "Claim abandoned outside a runtime, job not requeued");
            return;
        };
        tracing::warn!(request_id, "Claim abandoned before it settled, requeueing job");
        let dispatch = Arc::clone(&self.dispatch);
        runtime.spawn(async move {
            if let Err(e) = dispatch.enqueue(queued.request_id, &queued.job).await {
                tracing::error!(request_id, error = %e, "Failed to requeue abandoned job");
            }
        });
    }
}

/// Generation request lifecycle manager.
pub struct GenerationService {
    store: Arc<dyn RequestStore>,
    coverage: Arc<CoverageIndex>,
    dispatch: Arc<dyn WorkerDispatch>,
    estimator: Arc<dyn CompletionEstimator>,
    events: Arc<EventBus>,
}

impl GenerationService {
    pub fn new(
        store: Arc<dyn RequestStore>,
        coverage: Arc<CoverageIndex>,
        dispatch: Arc<dyn WorkerDispatch>,
        estimator: Arc<dyn CompletionEstimator>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            coverage,
            dispatch,
            estimator,
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn find(&self, request_id: DbId) -> Result<StoredRequest, CoreError> {
        self.store
            .find_request(request_id)
            .await
            .map_err(storage)?
            .ok_or(CoreError::NotFound {
                entity: "GenerationRequest",
                id: request_id,
            })
    }

    async fn find_and_authorize(
        &self,
        actor: &Actor,
        request_id: DbId,
    ) -> Result<StoredRequest, CoreError> {
        let stored = self.find(request_id).await?;
        ensure_owner(actor, "GenerationRequest", request_id, stored.user_id)?;
        Ok(stored)
    }

    fn publish(&self, kind: GenerationEventKind, stored: &StoredRequest) {
        self.events.publish(GenerationEvent::for_request(
            kind,
            stored.user_id,
            stored.request.clone(),
        ));
    }

    /// Move a request to `to`, attaching `images` in the same write.
    ///
    /// Re-reads and re-validates after every lost compare-and-set.
    /// Cancelling a terminal request reports it unchanged.
    async fn transition(
        &self,
        request_id: DbId,
        to: RequestStatus,
        images: &[NewGeneratedImage],
    ) -> Result<Transition, CoreError> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.find(request_id).await?;
            let from = current.request.status;

            if to == RequestStatus::Cancelled && state_machine::cancel_is_noop(from) {
                return Ok(Transition::Unchanged(current));
            }
            if !state_machine::can_transition(from, to) {
                return Err(CoreError::IllegalTransition {
                    request_id,
                    current: from,
                    requested: to,
                });
            }
            if to == RequestStatus::Succeeded
                && images.is_empty()
                && current.request.images.is_empty()
            {
                return Err(CoreError::Validation(format!(
                    "request {request_id} cannot succeed without images"
                )));
            }

            match self
                .store
                .transition_request(request_id, from, to, images)
                .await
                .map_err(storage)?
            {
                Some(updated) => {
                    tracing::info!(
                        request_id,
                        user_id = updated.user_id,
                        from = %from,
                        to = %to,
                        images = updated.request.images.len(),
                        "Generation request transitioned",
                    );
                    self.publish(GenerationEventKind::StatusChanged, &updated);
                    return Ok(Transition::Applied(updated));
                }
                None => {
                    tracing::debug!(request_id, from = %from, to = %to, "Lost status race, re-reading");
                }
            }
        }

        tracing::error!(request_id, to = %to, "Status transition did not settle");
        Err(CoreError::Internal(format!(
            "status of request {request_id} kept changing"
        )))
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate, check capacity, persist as `Pending` and enqueue.
    ///
    /// Nothing is persisted when validation or the capacity check fails. If
    /// the dispatcher refuses the job afterwards, the request is moved to
    /// `Error` and returned in that state.
    pub async fn create_request(
        &self,
        actor: &Actor,
        input: CreateGenerationRequest,
    ) -> Result<GenerationRequest, CoreError> {
        let job = input.into_job(actor.is_moderator)?;

        self.coverage
            .check(&job.resources(), &job.params.sampler)
            .map_err(|shortfall| CoreError::CapacityUnavailable(shortfall.to_string()))?;

        let estimated = self
            .estimator
            .estimate(&job, Utc::now())
            .await
            .map_err(storage)?;
        let stored = self
            .store
            .insert_request(actor.user_id, &job, estimated)
            .await
            .map_err(storage)?;
        let request_id = stored.request.id;

        tracing::info!(
            request_id,
            user_id = actor.user_id,
            model_id = job.model.id,
            quantity = job.quantity,
            priority = job.priority,
            "Generation request created",
        );
        self.publish(GenerationEventKind::RequestCreated, &stored);

        match self.dispatch.enqueue(request_id, &job).await {
            Ok(()) => Ok(stored.request),
            Err(e) => {
                tracing::warn!(request_id, error = %e, "Dispatch refused accepted job");
                self.fail_undispatched(request_id).await
            }
        }
    }

    /// Put every `Pending` request back on the dispatcher, oldest first.
    ///
    /// The dispatch queue lives in memory, so after a restart it is empty
    /// while the store still holds `Pending` requests. Run once at startup,
    /// before workers connect. A job the dispatcher refuses moves its
    /// request to `Error`, as at submission. Returns how many were queued.
    pub async fn recover_pending(&self) -> Result<usize, CoreError> {
        let pending = self.store.list_pending().await.map_err(storage)?;
        let found = pending.len();
        let mut requeued = 0;
        for stored in pending {
            let request_id = stored.request.id;
            match self.dispatch.enqueue(request_id, &stored.request.job).await {
                Ok(()) => requeued += 1,
                Err(e) => {
                    tracing::warn!(request_id, error = %e, "Dispatch refused recovered job");
                    self.fail_undispatched(request_id).await?;
                }
            }
        }
        tracing::info!(found, requeued, "Pending requests recovered");
        Ok(requeued)
    }

    /// `Pending` -> `Error` for a job the dispatcher would not take.
    async fn fail_undispatched(&self, request_id: DbId) -> Result<GenerationRequest, CoreError> {
        match self.transition(request_id, RequestStatus::Error, &[]).await {
            Ok(Transition::Applied(stored) | Transition::Unchanged(stored)) => Ok(stored.request),
            // Already settled by a concurrent cancel.
            Err(CoreError::IllegalTransition { .. }) => Ok(self.find(request_id).await?.request),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The caller's requests, newest first, strictly below `cursor`.
    pub async fn get_requests(
        &self,
        actor: &Actor,
        cursor: Option<DbId>,
        limit: Option<i64>,
    ) -> Result<Page<GenerationRequest>, CoreError> {
        let limit = clamp_limit(limit);
        let stored = self
            .store
            .list_requests(actor.user_id, cursor, limit)
            .await
            .map_err(storage)?;

        let full_page = stored.len() as i64 == limit;
        let items: Vec<GenerationRequest> = stored.into_iter().map(|s| s.request).collect();
        let next_cursor = if full_page {
            items.last().map(|r| r.id)
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub async fn get_request(
        &self,
        actor: &Actor,
        request_id: DbId,
    ) -> Result<GenerationRequest, CoreError> {
        Ok(self.find_and_authorize(actor, request_id).await?.request)
    }

    /// The settings of a past request, shaped as a new submission.
    pub async fn get_generation_data(
        &self,
        actor: &Actor,
        request_id: DbId,
    ) -> Result<CreateGenerationRequest, CoreError> {
        let stored = self.find_and_authorize(actor, request_id).await?;
        Ok(stored.request.job.to_submission())
    }

    /// The settings that produced an image, shaped as a new submission.
    pub async fn get_image_generation_data(
        &self,
        actor: &Actor,
        image_id: DbId,
    ) -> Result<CreateGenerationRequest, CoreError> {
        let image = self
            .store
            .find_images(&[image_id])
            .await
            .map_err(storage)?
            .into_iter()
            .next()
            .ok_or(CoreError::NotFound {
                entity: "GeneratedImage",
                id: image_id,
            })?;
        ensure_owner(actor, "GeneratedImage", image_id, image.user_id)?;
        Ok(self.find(image.image.request_id).await?.request.job.to_submission())
    }

    pub fn get_coverage(&self) -> Arc<Coverage> {
        self.coverage.get_coverage()
    }

    /// Whether the given resources and sampler can currently be served.
    pub fn check_resources_coverage(
        &self,
        resources: &[ResourceReference],
        sampler: &str,
    ) -> CoverageCheck {
        match self.coverage.check(resources, sampler) {
            Ok(()) => CoverageCheck {
                available: true,
                reason: None,
            },
            Err(shortfall) => CoverageCheck {
                available: false,
                reason: Some(shortfall.to_string()),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Worker callbacks
    // -----------------------------------------------------------------------

    /// Take the next queued job and move its request to `Processing`.
    ///
    /// Jobs whose request is no longer `Pending` (cancelled, deleted) are
    /// dropped. Returns `None` if nothing arrives within `wait`.
    ///
    /// A job popped from the queue goes back on it if the store write fails
    /// or if this future is dropped before the write settles.
    pub async fn claim_next_job(
        &self,
        wait: Duration,
    ) -> Result<Option<GenerationRequest>, CoreError> {
        while let Some(queued) = self.dispatch.claim(wait).await {
            let request_id = queued.request_id;
            let guard = RequeueOnDrop::new(Arc::clone(&self.dispatch), queued);
            let claimed = match self
                .store
                .transition_request(
                    request_id,
                    RequestStatus::Pending,
                    RequestStatus::Processing,
                    &[],
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    guard.requeue().await;
                    return Err(storage(e));
                }
            };
            guard.disarm();

            match claimed {
                Some(stored) => {
                    tracing::info!(request_id, user_id = stored.user_id, "Job claimed by worker");
                    self.publish(GenerationEventKind::StatusChanged, &stored);
                    return Ok(Some(stored.request));
                }
                None => {
                    tracing::debug!(request_id, "Skipping queued job whose request is no longer pending");
                }
            }
        }
        Ok(None)
    }

    /// Apply a worker-reported status.
    pub async fn update_status(
        &self,
        request_id: DbId,
        status: RequestStatus,
    ) -> Result<GenerationRequest, CoreError> {
        match self.transition(request_id, status, &[]).await? {
            Transition::Applied(stored) | Transition::Unchanged(stored) => Ok(stored.request),
        }
    }

    /// `Processing` -> `Succeeded` with the final images, atomically.
    pub async fn complete_request(
        &self,
        request_id: DbId,
        images: Vec<NewGeneratedImage>,
    ) -> Result<GenerationRequest, CoreError> {
        validate_images(&images)?;
        match self
            .transition(request_id, RequestStatus::Succeeded, &images)
            .await?
        {
            Transition::Applied(stored) | Transition::Unchanged(stored) => Ok(stored.request),
        }
    }

    /// Attach images to a request that is still `Processing`.
    pub async fn attach_images(
        &self,
        request_id: DbId,
        images: Vec<NewGeneratedImage>,
    ) -> Result<GenerationRequest, CoreError> {
        validate_images(&images)?;
        let attached = self
            .store
            .attach_images(request_id, RequestStatus::Processing, &images)
            .await
            .map_err(storage)?;

        let Some(stored) = attached else {
            let current = self.find(request_id).await?;
            return Err(CoreError::Validation(format!(
                "images can only be attached while Processing; request {request_id} is {}",
                current.request.status
            )));
        };

        tracing::info!(
            request_id,
            user_id = stored.user_id,
            added = images.len(),
            "Images attached to generation request",
        );
        self.publish(GenerationEventKind::ImagesAttached, &stored);
        Ok(stored.request)
    }

    /// Flag an image as available. Repeating the call changes nothing.
    pub async fn mark_image_available(&self, image_id: DbId) -> Result<GeneratedImage, CoreError> {
        let stored = self
            .store
            .mark_image_available(image_id)
            .await
            .map_err(storage)?
            .ok_or(CoreError::NotFound {
                entity: "GeneratedImage",
                id: image_id,
            })?;

        tracing::info!(image_id, request_id = stored.image.request_id, "Image available");
        if let Some(request) = self
            .store
            .find_request(stored.image.request_id)
            .await
            .map_err(storage)?
        {
            self.events.publish(
                GenerationEvent::for_request(
                    GenerationEventKind::ImageAvailable,
                    request.user_id,
                    request.request,
                )
                .with_image_ids(vec![image_id]),
            );
        }
        Ok(stored.image)
    }

    // -----------------------------------------------------------------------
    // User mutations
    // -----------------------------------------------------------------------

    /// Cancel a request. Cancelling a terminal request returns it unchanged.
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        request_id: DbId,
    ) -> Result<GenerationRequest, CoreError> {
        self.find_and_authorize(actor, request_id).await?;

        match self
            .transition(request_id, RequestStatus::Cancelled, &[])
            .await?
        {
            Transition::Applied(stored) => {
                if self.dispatch.cancel(request_id).await {
                    tracing::debug!(request_id, "Removed cancelled job from dispatch queue");
                }
                Ok(stored.request)
            }
            Transition::Unchanged(stored) => {
                tracing::info!(
                    request_id,
                    status = %stored.request.status,
                    "Cancel on terminal request ignored",
                );
                Ok(stored.request)
            }
        }
    }

    /// Delete a request and its images.
    pub async fn delete_request(&self, actor: &Actor, request_id: DbId) -> Result<(), CoreError> {
        let stored = self.find_and_authorize(actor, request_id).await?;

        let deleted = self.store.delete_request(request_id).await.map_err(storage)?;
        if !deleted {
            return Err(CoreError::NotFound {
                entity: "GenerationRequest",
                id: request_id,
            });
        }
        if !stored.request.status.is_terminal() {
            self.dispatch.cancel(request_id).await;
        }

        tracing::info!(
            request_id,
            user_id = actor.user_id,
            owner_id = stored.user_id,
            "Generation request deleted",
        );
        self.events
            .publish(GenerationEvent::request_deleted(stored.user_id, request_id));
        Ok(())
    }

    pub async fn delete_image(&self, actor: &Actor, image_id: DbId) -> Result<(), CoreError> {
        self.bulk_delete_images(actor, &[image_id]).await.map(|_| ())
    }

    /// Delete several images, all or nothing.
    ///
    /// Every id must exist and (for non-moderators) belong to the caller,
    /// otherwise nothing is deleted. Removing the last image of a
    /// `Succeeded` request is refused the same way. Returns the number of
    /// images removed.
    pub async fn bulk_delete_images(
        &self,
        actor: &Actor,
        image_ids: &[DbId],
    ) -> Result<u64, CoreError> {
        let ids: Vec<DbId> = image_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Err(CoreError::Validation(
                "at least one image id is required".to_string(),
            ));
        }

        let found = self.store.find_images(&ids).await.map_err(storage)?;
        let owners: BTreeMap<DbId, DbId> = found
            .iter()
            .map(|stored| (stored.image.id, stored.user_id))
            .collect();
        for id in &ids {
            let owner = owners.get(id).ok_or(CoreError::NotFound {
                entity: "GeneratedImage",
                id: *id,
            })?;
            ensure_owner(actor, "GeneratedImage", *id, *owner)?;
        }

        let deleted = self
            .store
            .delete_images(&ids)
            .await
            .map_err(storage)?
            .ok_or_else(|| {
                CoreError::Validation(
                    "a succeeded request must keep at least one image; delete the request instead"
                        .to_string(),
                )
            })?;
        tracing::info!(user_id = actor.user_id, requested = ids.len(), deleted, "Images deleted");

        let mut by_owner: BTreeMap<DbId, Vec<DbId>> = BTreeMap::new();
        for (image_id, owner) in owners {
            by_owner.entry(owner).or_default().push(image_id);
        }
        for (owner, image_ids) in by_owner {
            self.events
                .publish(GenerationEvent::images_deleted(owner, image_ids));
        }
        Ok(deleted)
    }
}
