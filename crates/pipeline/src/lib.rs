//! Generation request lifecycle.
//!
//! [`service::GenerationService`] is the single owner of request state. It
//! validates submissions against the [`coverage_index::CoverageIndex`],
//! persists through an `atelier_db` [`RequestStore`](atelier_db::store::RequestStore),
//! hands accepted jobs to a [`dispatch::WorkerDispatch`] and publishes every
//! change on the event bus.

pub mod coverage_index;
pub mod dispatch;
pub mod estimator;
pub mod service;

pub use service::{Actor, CoverageCheck, GenerationService, Page};
