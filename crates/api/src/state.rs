use std::sync::Arc;

use atelier_db::store::RequestStore;
use atelier_db::DbPool;
use atelier_events::EventBus;
use atelier_pipeline::coverage_index::CoverageIndex;
use atelier_pipeline::dispatch::DispatchQueue;
use atelier_pipeline::estimator::QueueDepthEstimator;
use atelier_pipeline::GenerationService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Request lifecycle manager.
    pub generation: Arc<GenerationService>,
    pub coverage: Arc<CoverageIndex>,
    pub dispatch: Arc<DispatchQueue>,
    pub event_bus: Arc<EventBus>,
    /// Present when running on PostgreSQL; used by the health check.
    pub pool: Option<DbPool>,
}

impl AppState {
    /// Wire the lifecycle manager over `store`.
    pub fn assemble(
        config: ServerConfig,
        store: Arc<dyn RequestStore>,
        coverage: Arc<CoverageIndex>,
        pool: Option<DbPool>,
    ) -> Self {
        let dispatch = Arc::new(DispatchQueue::new(config.dispatch_queue_capacity));
        let event_bus = Arc::new(EventBus::default());
        let estimator = Arc::new(QueueDepthEstimator::new(
            Arc::clone(&store),
            config.secs_per_image_step,
        ));
        let generation = Arc::new(GenerationService::new(
            store,
            Arc::clone(&coverage),
            Arc::clone(&dispatch) as _,
            estimator,
            Arc::clone(&event_bus),
        ));

        Self {
            config: Arc::new(config),
            generation,
            coverage,
            dispatch,
            event_bus,
            pool,
        }
    }
}
