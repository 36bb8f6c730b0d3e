//! Read-mostly snapshot of worker coverage and the loop that refreshes it.
//!
//! The request path only ever reads an `Arc<Coverage>`; the refresh loop
//! builds a complete new [`Coverage`] and swaps it in, so readers never
//! observe a half-built snapshot.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::coverage::{CapacityShortfall, Coverage, WorkerCapabilities};
use atelier_core::generation::ResourceReference;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Shared coverage snapshot.
#[derive(Debug, Default)]
pub struct CoverageIndex {
    snapshot: RwLock<Arc<Coverage>>,
}

impl CoverageIndex {
    pub fn new(initial: Coverage) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current snapshot.
    pub fn get_coverage(&self) -> Arc<Coverage> {
        // The lock only guards an Arc swap, so a poisoned lock still holds a
        // complete snapshot.
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn has_capacity(&self, resources: &[ResourceReference], sampler: &str) -> bool {
        self.get_coverage().has_capacity(resources, sampler)
    }

    pub fn check(
        &self,
        resources: &[ResourceReference],
        sampler: &str,
    ) -> Result<(), CapacityShortfall> {
        self.get_coverage().check(resources, sampler)
    }

    /// Swap in a freshly built snapshot.
    pub fn replace(&self, coverage: Coverage) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(coverage);
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoverageSourceError {
    #[error("coverage request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("coverage payload not understood: {0}")]
    Decode(String),
}

/// Where fresh coverage comes from.
#[async_trait]
pub trait CoverageSource: Send + Sync {
    async fn fetch(&self) -> Result<Coverage, CoverageSourceError>;
}

/// Accepted response bodies: either ready-made coverage maps or a raw fleet
/// listing, optionally wrapped in a `{ "data": ... }` envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoveragePayload {
    Fleet(Vec<WorkerCapabilities>),
    Enveloped { data: Box<CoveragePayload> },
    Coverage(Coverage),
}

impl CoveragePayload {
    fn into_coverage(self) -> Coverage {
        match self {
            CoveragePayload::Fleet(workers) => Coverage::from_workers(&workers),
            CoveragePayload::Enveloped { data } => data.into_coverage(),
            CoveragePayload::Coverage(coverage) => coverage,
        }
    }
}

/// Decode a coverage response body.
///
/// An empty object is refused: coverage maps always serialize their keys,
/// so `{}` is a broken upstream rather than an idle fleet. An idle fleet
/// reports `[]`.
pub fn parse_coverage_payload(body: serde_json::Value) -> Result<Coverage, CoverageSourceError> {
    if body.as_object().is_some_and(|object| object.is_empty()) {
        return Err(CoverageSourceError::Decode(
            "empty object is not a coverage payload".to_string(),
        ));
    }
    serde_json::from_value::<CoveragePayload>(body)
        .map(CoveragePayload::into_coverage)
        .map_err(|e| CoverageSourceError::Decode(e.to_string()))
}

/// Fetches coverage from an HTTP endpoint with `GET`.
pub struct HttpCoverageSource {
    client: reqwest::Client,
    url: String,
}

impl HttpCoverageSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CoverageSource for HttpCoverageSource {
    async fn fetch(&self) -> Result<Coverage, CoverageSourceError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        parse_coverage_payload(body)
    }
}

/// Always returns the same coverage. Used when no coverage endpoint is
/// configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCoverageSource {
    coverage: Coverage,
}

impl StaticCoverageSource {
    pub fn new(coverage: Coverage) -> Self {
        Self { coverage }
    }
}

#[async_trait]
impl CoverageSource for StaticCoverageSource {
    async fn fetch(&self) -> Result<Coverage, CoverageSourceError> {
        Ok(self.coverage.clone())
    }
}

// ---------------------------------------------------------------------------
// Refresh loop
// ---------------------------------------------------------------------------

/// Fetch once and swap the snapshot. On failure the previous snapshot stays.
pub async fn refresh_once(
    index: &CoverageIndex,
    source: &dyn CoverageSource,
) -> Result<(), CoverageSourceError> {
    let coverage = source.fetch().await?;
    tracing::debug!(
        assets = coverage.assets.len(),
        asset_types = coverage.asset_types.len(),
        schedulers = coverage.schedulers.len(),
        "Coverage refreshed"
    );
    index.replace(coverage);
    Ok(())
}

/// Refresh `index` from `source` every `interval` until `cancel` fires.
///
/// The first refresh happens immediately.
pub async fn run_refresh(
    index: Arc<CoverageIndex>,
    source: Arc<dyn CoverageSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Coverage refresh started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Coverage refresh stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = refresh_once(&index, source.as_ref()).await {
                    tracing::warn!(error = %e, "Coverage refresh failed, keeping previous snapshot");
                }
            }
        }
    }
}
