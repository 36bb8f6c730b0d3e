//! Request extractors that authenticate callers.
//!
//! - [`auth::AuthUser`] -- end user from a JWT Bearer token.
//! - [`auth::WorkerAuth`] -- rendering worker from the `x-worker-token` header.

pub mod auth;
