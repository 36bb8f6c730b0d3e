//! Estimated completion time for newly accepted requests.

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::generation::Job;
use atelier_core::types::Timestamp;
use atelier_db::store::{RequestStore, StoreError};

/// Default seconds of worker time per image per sampling step.
pub const DEFAULT_SECS_PER_IMAGE_STEP: f64 = 0.15;

/// Upper bound on any estimate, so a runaway queue cannot overflow dates.
const MAX_ESTIMATE_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[async_trait]
pub trait CompletionEstimator: Send + Sync {
    /// When `job`, accepted at `now`, is expected to finish.
    async fn estimate(&self, job: &Job, now: Timestamp) -> Result<Timestamp, StoreError>;
}

/// Estimates from the number of active requests queued at the same or a
/// higher priority.
///
/// Each job ahead is assumed to cost as much as this one:
/// `(ahead + 1) * quantity * steps * secs_per_image_step`.
pub struct QueueDepthEstimator {
    store: Arc<dyn RequestStore>,
    secs_per_image_step: f64,
}

impl QueueDepthEstimator {
    pub fn new(store: Arc<dyn RequestStore>, secs_per_image_step: f64) -> Self {
        Self {
            store,
            secs_per_image_step,
        }
    }
}

/// Pure estimate in whole seconds, clamped to `0..=MAX_ESTIMATE_SECS`.
pub fn estimate_secs(ahead: i64, quantity: i32, steps: i32, secs_per_image_step: f64) -> i64 {
    let per_job = f64::from(quantity.max(1)) * f64::from(steps.max(1)) * secs_per_image_step;
    let total = (ahead.max(0) as f64 + 1.0) * per_job;
    if !total.is_finite() {
        return MAX_ESTIMATE_SECS as i64;
    }
    total.clamp(0.0, MAX_ESTIMATE_SECS).ceil() as i64
}

#[async_trait]
impl CompletionEstimator for QueueDepthEstimator {
    async fn estimate(&self, job: &Job, now: Timestamp) -> Result<Timestamp, StoreError> {
        let ahead = self.store.count_active_at_or_above(job.priority).await?;
        let secs = estimate_secs(
            ahead,
            job.quantity,
            job.params.steps,
            self.secs_per_image_step,
        );
        Ok(now + chrono::Duration::seconds(secs))
    }
}
