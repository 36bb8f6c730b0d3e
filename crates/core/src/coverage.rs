//! Worker coverage of assets, model types and samplers.
//!
//! A [`Coverage`] is rebuilt out-of-band (see the pipeline crate's refresh
//! loop) and only ever read on the request path. The capacity policy is
//! conservative: every referenced asset id must have workers of its own,
//! regardless of how well its model type is covered in aggregate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::generation::{ModelType, ResourceReference};
use crate::types::DbId;

/// Worker count for a single service provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProviderCoverage {
    pub workers: u32,
}

/// Coverage of one asset, model type or sampler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCoverage {
    pub workers: u32,
    #[serde(default)]
    pub service_providers: BTreeMap<String, ServiceProviderCoverage>,
}

impl ItemCoverage {
    fn add_worker(&mut self, provider: &str) {
        self.workers += 1;
        self.service_providers
            .entry(provider.to_string())
            .or_default()
            .workers += 1;
    }

    /// Providers with at least one worker for this item.
    fn providers(&self) -> BTreeSet<&str> {
        self.service_providers
            .iter()
            .filter(|(_, p)| p.workers > 0)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Capabilities advertised by one worker, as reported by the fleet listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    pub service_provider: String,
    #[serde(default)]
    pub assets: Vec<DbId>,
    #[serde(default)]
    pub asset_types: Vec<ModelType>,
    #[serde(default)]
    pub schedulers: Vec<String>,
}

/// Why a resource/sampler combination cannot be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityShortfall {
    #[error("no workers available for sampler '{0}'")]
    Sampler(String),

    #[error("no workers available for resource {0}")]
    Resource(DbId),

    #[error("no single service provider serves every requested resource with sampler '{0}'")]
    NoCommonProvider(String),
}

/// Aggregate worker availability keyed by asset id, model type and sampler.
///
/// Unknown keys are rejected so an error body such as
/// `{"message": "rate limited"}` never decodes as empty coverage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Coverage {
    #[serde(default)]
    pub assets: BTreeMap<DbId, ItemCoverage>,
    #[serde(default)]
    pub asset_types: BTreeMap<ModelType, ItemCoverage>,
    #[serde(default)]
    pub schedulers: BTreeMap<String, ItemCoverage>,
}

impl Coverage {
    /// Aggregate a fleet listing into coverage maps.
    ///
    /// Duplicate entries inside one worker's lists are counted once.
    pub fn from_workers<'a>(workers: impl IntoIterator<Item = &'a WorkerCapabilities>) -> Self {
        let mut coverage = Coverage::default();
        for worker in workers {
            let provider = worker.service_provider.as_str();
            for asset in worker.assets.iter().collect::<BTreeSet<_>>() {
                coverage.assets.entry(*asset).or_default().add_worker(provider);
            }
            for model_type in worker.asset_types.iter().collect::<BTreeSet<_>>() {
                coverage
                    .asset_types
                    .entry(*model_type)
                    .or_default()
                    .add_worker(provider);
            }
            for scheduler in worker.schedulers.iter().collect::<BTreeSet<_>>() {
                coverage
                    .schedulers
                    .entry(scheduler.clone())
                    .or_default()
                    .add_worker(provider);
            }
        }
        coverage
    }

    pub fn asset_workers(&self, id: DbId) -> u32 {
        self.assets.get(&id).map_or(0, |c| c.workers)
    }

    pub fn asset_type_workers(&self, model_type: ModelType) -> u32 {
        self.asset_types.get(&model_type).map_or(0, |c| c.workers)
    }

    pub fn scheduler_workers(&self, sampler: &str) -> u32 {
        self.schedulers.get(sampler).map_or(0, |c| c.workers)
    }

    /// Check that at least one worker can serve every resource together with
    /// `sampler`.
    ///
    /// - The sampler must have workers.
    /// - Every resource id must have workers. A missing entry counts as zero
    ///   and the model type's aggregate is not consulted.
    /// - When every relevant entry carries a provider breakdown, one provider
    ///   must cover all of them.
    pub fn check(
        &self,
        resources: &[ResourceReference],
        sampler: &str,
    ) -> Result<(), CapacityShortfall> {
        let Some(scheduler) = self.schedulers.get(sampler).filter(|c| c.workers > 0) else {
            return Err(CapacityShortfall::Sampler(sampler.to_string()));
        };

        let mut entries = Vec::with_capacity(resources.len() + 1);
        entries.push(scheduler);
        for resource in resources {
            match self.assets.get(&resource.id).filter(|c| c.workers > 0) {
                Some(entry) => entries.push(entry),
                None => return Err(CapacityShortfall::Resource(resource.id)),
            }
        }

        if entries.iter().any(|e| e.service_providers.is_empty()) {
            return Ok(());
        }

        let mut common = scheduler.providers();
        for entry in &entries[1..] {
            let providers = entry.providers();
            common.retain(|p| providers.contains(p));
        }
        if common.is_empty() {
            return Err(CapacityShortfall::NoCommonProvider(sampler.to_string()));
        }
        Ok(())
    }

    /// Whether [`check`](Self::check) passes.
    pub fn has_capacity(&self, resources: &[ResourceReference], sampler: &str) -> bool {
        self.check(resources, sampler).is_ok()
    }
}
