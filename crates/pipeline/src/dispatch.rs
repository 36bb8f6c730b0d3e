//! Hand-off of accepted jobs to rendering workers.
//!
//! [`WorkerDispatch`] is the seam the lifecycle manager enqueues through.
//! [`DispatchQueue`] is the in-process implementation: a bounded priority
//! queue that workers drain through the internal claim endpoint.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::generation::Job;
use atelier_core::types::DbId;
use tokio::sync::{Mutex, Notify};

/// Default maximum number of queued jobs.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("dispatch queue is closed")]
    Closed,
}

/// A job waiting for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub request_id: DbId,
    pub job: Job,
}

#[async_trait]
pub trait WorkerDispatch: Send + Sync {
    /// Queue a job for the request. Fails if the job cannot be accepted.
    async fn enqueue(&self, request_id: DbId, job: &Job) -> Result<(), DispatchError>;

    /// Drop a queued job. Returns `true` if it was still queued.
    async fn cancel(&self, request_id: DbId) -> bool;

    /// Take the next job, waiting up to `wait` for one to arrive.
    async fn claim(&self, wait: Duration) -> Option<QueuedJob>;
}

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

/// Heap entry: higher priority first, then lower request id (FIFO).
#[derive(Debug)]
struct Entry(QueuedJob);

impl Entry {
    fn key(&self) -> (i32, std::cmp::Reverse<DbId>) {
        (self.0.job.priority, std::cmp::Reverse(self.0.request_id))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    closed: bool,
}

/// Bounded in-process priority queue.
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            capacity,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Refuse further jobs and wake every waiting claimer.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.available.notify_waiters();
    }

    async fn try_claim(&self) -> Option<QueuedJob> {
        self.state.lock().await.heap.pop().map(|entry| entry.0)
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl WorkerDispatch for DispatchQueue {
    async fn enqueue(&self, request_id: DbId, job: &Job) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(DispatchError::Closed);
            }
            if state.heap.len() >= self.capacity {
                return Err(DispatchError::QueueFull(self.capacity));
            }
            state.heap.push(Entry(QueuedJob {
                request_id,
                job: job.clone(),
            }));
        }
        self.available.notify_one();
        Ok(())
    }

    async fn cancel(&self, request_id: DbId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.heap.len();
        state.heap.retain(|entry| entry.0.request_id != request_id);
        state.heap.len() != before
    }

    async fn claim(&self, wait: Duration) -> Option<QueuedJob> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so an enqueue between the
            // check and the wait is not missed.
            let notified = self.available.notified();
            if let Some(job) = self.try_claim().await {
                return Some(job);
            }
            if self.state.lock().await.closed {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}
