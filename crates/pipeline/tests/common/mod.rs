#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::coverage::{Coverage, WorkerCapabilities};
use atelier_core::generation::{
    CreateGenerationRequest, Job, ModelType, NewGeneratedImage, ResourceReference,
};
use atelier_core::types::DbId;
use atelier_db::store::{MemoryRequestStore, RequestStore};
use atelier_events::EventBus;
use atelier_pipeline::coverage_index::CoverageIndex;
use atelier_pipeline::dispatch::{DispatchError, DispatchQueue, QueuedJob, WorkerDispatch};
use atelier_pipeline::estimator::QueueDepthEstimator;
use atelier_pipeline::GenerationService;

pub const OWNER: DbId = 1;
pub const OTHER_USER: DbId = 2;
pub const MODERATOR: DbId = 3;

/// Checkpoint used by [`submission`].
pub const CHECKPOINT_ID: DbId = 101;
/// LoRA used by [`submission`].
pub const LORA_ID: DbId = 202;

pub struct Harness {
    pub service: Arc<GenerationService>,
    pub store: Arc<MemoryRequestStore>,
    pub queue: Arc<DispatchQueue>,
    pub events: Arc<EventBus>,
    pub coverage: Arc<CoverageIndex>,
}

/// Two workers from one provider covering the submission's resources.
pub fn covered_fleet() -> Coverage {
    let worker = |id: &str, assets: Vec<DbId>| WorkerCapabilities {
        worker_id: id.to_string(),
        service_provider: "alpha".to_string(),
        assets,
        asset_types: vec![ModelType::Checkpoint, ModelType::Lora],
        schedulers: vec!["Euler a".to_string(), "DDIM".to_string()],
    };
    Coverage::from_workers(&[
        worker("w1", vec![CHECKPOINT_ID, LORA_ID]),
        worker("w2", vec![CHECKPOINT_ID]),
    ])
}

/// Service over an in-memory store and an in-process dispatch queue.
pub fn harness() -> Harness {
    let queue = Arc::new(DispatchQueue::default());
    harness_with(Arc::clone(&queue) as Arc<dyn WorkerDispatch>, queue)
}

/// Service whose dispatcher refuses every job.
pub fn refusing_harness() -> Harness {
    harness_with(Arc::new(RefusingDispatch), Arc::new(DispatchQueue::default()))
}

fn harness_with(dispatch: Arc<dyn WorkerDispatch>, queue: Arc<DispatchQueue>) -> Harness {
    let store = Arc::new(MemoryRequestStore::new());
    let events = Arc::new(EventBus::default());
    let coverage = Arc::new(CoverageIndex::new(covered_fleet()));
    let service = service_over(
        Arc::clone(&store) as Arc<dyn RequestStore>,
        dispatch,
        Arc::clone(&coverage),
        Arc::clone(&events),
    );
    Harness {
        service,
        store,
        queue,
        events,
        coverage,
    }
}

/// A service over an existing store, as a freshly started process would
/// build it.
pub fn service_over(
    store: Arc<dyn RequestStore>,
    dispatch: Arc<dyn WorkerDispatch>,
    coverage: Arc<CoverageIndex>,
    events: Arc<EventBus>,
) -> Arc<GenerationService> {
    let estimator = Arc::new(QueueDepthEstimator::new(Arc::clone(&store), 0.15));
    Arc::new(GenerationService::new(
        store, coverage, dispatch, estimator, events,
    ))
}

pub fn submission() -> CreateGenerationRequest {
    CreateGenerationRequest {
        resources: vec![
            ResourceReference::new(CHECKPOINT_ID, ModelType::Checkpoint),
            ResourceReference::new(LORA_ID, ModelType::Lora).with_strength(0.7),
        ],
        prompt: "an old lighthouse on a cliff, storm clouds".to_string(),
        negative_prompt: None,
        width: 512,
        height: 768,
        sampler: "Euler a".to_string(),
        steps: 25,
        cfg_scale: 7.0,
        seed: Some(42),
        clip_skip: None,
        quantity: 2,
        priority: None,
    }
}

pub fn image(hash: &str) -> NewGeneratedImage {
    NewGeneratedImage {
        hash: hash.to_string(),
        url: format!("https://images.test/{hash}.png"),
        available: false,
    }
}

/// Dispatcher that accepts nothing, standing in for a fleet that vanished
/// after the capacity check.
pub struct RefusingDispatch;

#[async_trait]
impl WorkerDispatch for RefusingDispatch {
    async fn enqueue(&self, _request_id: DbId, _job: &Job) -> Result<(), DispatchError> {
        Err(DispatchError::QueueFull(0))
    }

    async fn cancel(&self, _request_id: DbId) -> bool {
        false
    }

    async fn claim(&self, _wait: Duration) -> Option<QueuedJob> {
        None
    }
}
