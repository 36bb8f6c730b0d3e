//! Authentication primitives.
//!
//! - [`jwt`] -- verification of identity-service bearer tokens.

pub mod jwt;
