//! Client side of the generation API.
//!
//! - [`store`] -- the reconciliation store holding a client's working set.
//! - [`http`] -- a `reqwest` client for every exposed route.

pub mod error;
pub mod http;
pub mod store;

pub use error::ClientError;
pub use http::{CoverageAnswer, GenerationClient, RequestPage};
pub use store::{FetchTicket, Reconciliation, ReconciliationStore};
