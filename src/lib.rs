//! Batch recipe generation pipeline: plan, generate, validate, persist and
//! illustrate N items in sequential chunks while streaming live progress.

pub mod agents;
pub mod clients;
pub mod config;
pub mod coordinator;
pub mod data_url;
pub mod error;
pub mod hashing;
pub mod models;
pub mod placeholders;
pub mod progress;
pub mod retry;
pub mod routes;
pub mod stream;

pub use config::PipelineConfig;
pub use coordinator::{Collaborators, Coordinator};
pub use error::{ApiError, PipelineError};
pub use progress::{JobProgress, Phase, ProgressTracker};
pub use stream::ProgressStream;
