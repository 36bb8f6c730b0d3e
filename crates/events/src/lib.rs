//! In-process fan-out of generation lifecycle events.
//!
//! The lifecycle manager publishes a [`bus::GenerationEvent`] after every
//! successful mutation; the API streams them to clients over SSE.

pub mod bus;

pub use bus::{EventBus, GenerationEvent, GenerationEventKind};
