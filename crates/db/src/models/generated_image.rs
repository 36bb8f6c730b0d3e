//! Generated image rows.

use atelier_core::generation::GeneratedImage;
use atelier_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use crate::store::StoredImage;

/// A row from the `generated_images` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GeneratedImageRow {
    pub id: DbId,
    pub request_id: DbId,
    pub user_id: DbId,
    pub hash: String,
    pub url: String,
    pub available: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GeneratedImageRow {
    pub fn into_image(self) -> GeneratedImage {
        GeneratedImage {
            id: self.id,
            hash: self.hash,
            url: self.url,
            available: self.available,
            request_id: self.request_id,
        }
    }

    pub fn into_stored(self) -> StoredImage {
        StoredImage {
            user_id: self.user_id,
            image: self.into_image(),
        }
    }
}
