use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::clients::ImageClient;
use crate::config::PipelineConfig;
use crate::error::ImageApiError;
use crate::hashing::stable_hash;
use crate::models::{ImageOutcome, ImageResult, PersistedItemResult};
use crate::placeholders::PlaceholderPool;
use crate::progress::{ProgressReporter, ProgressUpdate};
use crate::retry::{retry, RetryPolicy};

/// Job-scoped record of `(name, url suffix)` hashes already handed out.
///
/// This is a cheap identity check, not perceptual hashing: two different
/// URLs for visually identical images are not caught.
pub struct DuplicateCache {
    seen: Mutex<HashSet<u64>>,
    suffix_len: usize,
}

impl DuplicateCache {
    pub fn new(suffix_len: usize) -> Self {
        Self { seen: Mutex::new(HashSet::new()), suffix_len: suffix_len.max(1) }
    }

    pub fn key(&self, name: &str, url: &str) -> u64 {
        let start = url.char_indices().rev().nth(self.suffix_len - 1).map_or(0, |(i, _)| i);
        stable_hash([name.trim().to_lowercase().as_bytes(), url[start..].as_bytes()])
    }

    /// Records the pair. Returns false if it was already seen in this job.
    pub fn insert(&self, name: &str, url: &str) -> bool {
        let key = self.key(name, url);
        self.seen.lock().insert(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

pub struct ImageGenerationAgent {
    client: Arc<dyn ImageClient>,
    placeholders: Arc<PlaceholderPool>,
    timeout: Duration,
    retry: RetryPolicy,
    concurrency: usize,
}

impl ImageGenerationAgent {
    pub fn new(client: Arc<dyn ImageClient>, placeholders: Arc<PlaceholderPool>, config: &PipelineConfig) -> Self {
        Self {
            client,
            placeholders,
            timeout: config.image_timeout,
            retry: config.image_retry(),
            concurrency: config.image_concurrency.max(1),
        }
    }

    /// Prompt from the item's own fields. `None` when name or description
    /// is missing: a generic prompt would only produce an interchangeable image.
    pub fn build_prompt(item: &PersistedItemResult) -> Option<String> {
        let name = item.name.trim();
        let description = item.description.trim();
        if name.is_empty() || description.is_empty() {
            return None;
        }
        let mut prompt = format!(
            "Professional food photography of {name}. {description}. \
             Plated on a neutral surface, natural light, shallow depth of field, 1024x1024, high detail."
        );
        if !item.categories.is_empty() {
            prompt.push_str(&format!(" Served as {}.", item.categories.join(", ")));
        }
        prompt.push_str(" No text, no watermark.");
        Some(prompt)
    }

    pub async fn generate(&self, item: &PersistedItemResult, cache: &DuplicateCache) -> ImageResult {
        let Some(prompt) = Self::build_prompt(item) else {
            let reason = format!("item {} reached imaging without name/description, prompt not built", item.id);
            error!(item_id = %item.id, chunk = item.chunk_index, "❌ {reason}");
            return ImageResult {
                item_id: item.id.clone(),
                outcome: ImageOutcome::Failed,
                url: item.image_url.clone(),
                attempts: 0,
                error: Some(reason),
            };
        };

        let prompt = prompt.as_str();
        let outcome = retry(&self.retry, "image.generate", move |_| async move {
            let url = match tokio::time::timeout(self.timeout, self.client.generate_image(prompt)).await {
                Ok(Ok(url)) => url,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ImageApiError::Timeout),
            };
            if !cache.insert(&item.name, &url) {
                return Err(ImageApiError::Duplicate);
            }
            Ok(url)
        })
        .await;

        match outcome.result {
            Ok(url) => {
                info!(item_id = %item.id, attempts = outcome.attempts, "🎨 image generated");
                ImageResult {
                    item_id: item.id.clone(),
                    outcome: ImageOutcome::Generated,
                    url,
                    attempts: outcome.attempts,
                    error: None,
                }
            }
            Err(e) => {
                let placeholder = self.placeholders.select(&item.categories, &item.id, item.chunk_index, item.position);
                warn!(
                    item_id = %item.id,
                    attempts = outcome.attempts,
                    error = %e,
                    placeholder = %placeholder.name,
                    "⚠️ image generation exhausted, using placeholder"
                );
                ImageResult {
                    item_id: item.id.clone(),
                    outcome: ImageOutcome::PlaceholderFallback,
                    url: placeholder.data_url.clone(),
                    attempts: outcome.attempts,
                    error: Some(format!("image for '{}' fell back to placeholder: {e}", item.name)),
                }
            }
        }
    }

    /// Generates images for a whole chunk with at most `image_concurrency`
    /// calls in flight. Results come back in input order; a failing item
    /// never affects the others.
    pub async fn generate_batch(
        &self,
        items: &[PersistedItemResult],
        cache: &DuplicateCache,
        reporter: &ProgressReporter,
    ) -> Vec<ImageResult> {
        // futures are built up front so the spawned job future stays `Send`
        let pending: Vec<_> = items.iter().map(|item| self.generate_reported(item, cache, reporter)).collect();
        stream::iter(pending).buffered(self.concurrency).collect().await
    }

    async fn generate_reported(
        &self,
        item: &PersistedItemResult,
        cache: &DuplicateCache,
        reporter: &ProgressReporter,
    ) -> ImageResult {
        let result = self.generate(item, cache).await;
        reporter.report(ProgressUpdate::ImageGenerated { item_id: result.item_id.clone(), outcome: result.outcome });
        result
    }
}
