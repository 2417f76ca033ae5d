//! External collaborators the pipeline consumes.

pub mod gemini;
pub mod memory;
pub mod object_store;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ContentError, ImageApiError, PersistenceError, StorageError};
use crate::models::{ChunkSpec, GeneratedItem, GenerationRequest, ItemId};

#[async_trait]
pub trait ContentClient: Send + Sync {
    /// Expands a request into one short concept per item.
    async fn plan_concepts(&self, request: &GenerationRequest) -> Result<Vec<String>, ContentError>;

    /// Generates every item of one chunk in a single call.
    async fn generate_items(&self, chunk: &ChunkSpec) -> Result<Vec<GeneratedItem>, ContentError>;
}

#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Returns a temporary URL (possibly a `data:` URL) for the generated image.
    async fn generate_image(&self, prompt: &str) -> Result<String, ImageApiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadBody {
    Bytes { content_type: String, data: Bytes },
    Url(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores the image under `key` and returns its permanent URL.
    async fn upload(&self, body: UploadBody, key: &str) -> Result<String, StorageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRecipe {
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub attributes: std::collections::BTreeMap<String, f64>,
}

#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Inserts the whole batch in one transaction and returns ids in input
    /// order. Nothing is committed when an error is returned.
    async fn insert_batch(&self, rows: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError>;

    async fn update_image(&self, id: &ItemId, url: &str) -> Result<(), PersistenceError>;
}
