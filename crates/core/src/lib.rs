//! Domain core for the generation request service.
//!
//! Zero internal dependencies: every other crate in the workspace builds on
//! these types, errors and pure policies.

pub mod coverage;
pub mod error;
pub mod generation;
pub mod roles;
pub mod scheduling;
pub mod types;
