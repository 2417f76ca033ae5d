//! The six pipeline stages. Each agent owns its collaborator handle and the
//! slice of [`PipelineConfig`](crate::config::PipelineConfig) it needs.

pub mod concept;
pub mod content;
pub mod image_gen;
pub mod image_store;
pub mod persistence;
pub mod validation;

pub use concept::ConceptAgent;
pub use content::ContentGenerationAgent;
pub use image_gen::{DuplicateCache, ImageGenerationAgent};
pub use image_store::ImageStorageAgent;
pub use persistence::PersistenceAgent;
pub use validation::{ValidationAgent, ValidationReport};
