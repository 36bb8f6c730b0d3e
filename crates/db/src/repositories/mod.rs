//! Repository layer: zero-sized structs with async `&PgPool` methods.

pub mod generated_image_repo;
pub mod generation_request_repo;

pub use generated_image_repo::GeneratedImageRepo;
pub use generation_request_repo::GenerationRequestRepo;
