use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::clients::ContentClient;
use crate::config::PipelineConfig;
use crate::error::{ContentError, PipelineError};
use crate::models::{ChunkSpec, GeneratedItem};
use crate::retry::{retry, RetryPolicy};

/// One content-API call per chunk. A chunk succeeds or fails as a unit.
pub struct ContentGenerationAgent {
    client: Arc<dyn ContentClient>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ContentGenerationAgent {
    pub fn new(client: Arc<dyn ContentClient>, config: &PipelineConfig) -> Self {
        Self { client, timeout: config.content_timeout, retry: config.content_retry() }
    }

    pub async fn generate_chunk(&self, chunk: &ChunkSpec) -> Result<Vec<GeneratedItem>, PipelineError> {
        let outcome = retry(&self.retry, "content.generate_chunk", move |_| async move {
            match tokio::time::timeout(self.timeout, self.client.generate_items(chunk)).await {
                Ok(result) => result,
                Err(_) => Err(ContentError::Timeout),
            }
        })
        .await;

        match outcome.result {
            Ok(items) => {
                info!(chunk = chunk.index, items = items.len(), attempts = outcome.attempts, "✅ chunk content generated");
                Ok(items)
            }
            Err(source) => {
                error!(chunk = chunk.index, attempts = outcome.attempts, error = %source, "❌ chunk content generation failed");
                Err(PipelineError::Generation { chunk: chunk.index, source })
            }
        }
    }
}
