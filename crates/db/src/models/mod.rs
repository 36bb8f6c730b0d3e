//! Row structs for the generation tables.
//!
//! Rows mirror the columns one-to-one; the `into_*` helpers turn them into
//! the `atelier_core` projections handed to callers.

pub mod generated_image;
pub mod generation_request;
