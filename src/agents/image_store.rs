use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::clients::{ObjectStore, UploadBody};
use crate::config::PipelineConfig;
use crate::data_url;
use crate::error::StorageError;
use crate::models::{ImageResult, ItemId, JobId, StoredImage};
use crate::progress::{ProgressReporter, ProgressUpdate};
use crate::retry::{retry, RetryPolicy};

/// Moves images to durable storage through a fixed pool of upload permits.
/// A failed upload keeps the temporary URL; it never fails the item.
pub struct ImageStorageAgent {
    store: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ImageStorageAgent {
    pub fn new(store: Arc<dyn ObjectStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            timeout: config.upload_timeout,
            retry: config.upload_retry(),
        }
    }

    pub async fn upload(&self, job_id: JobId, image: &ImageResult) -> StoredImage {
        let fallback = |error: String| {
            warn!(job_id = %job_id, item_id = %image.item_id, error = %error, "⚠️ upload failed, keeping temporary url");
            StoredImage { item_id: image.item_id.clone(), url: image.url.clone(), permanent: false, error: Some(error) }
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return fallback("upload pool closed".into());
        };

        let body = match data_url::decode(&image.url) {
            Some((content_type, data)) => UploadBody::Bytes { content_type, data },
            None => UploadBody::Url(image.url.clone()),
        };
        let key = object_key(job_id, &image.item_id, &body);

        let body = &body;
        let key_ref = key.as_str();
        let outcome = retry(&self.retry, "storage.upload", move |_| async move {
            match tokio::time::timeout(self.timeout, self.store.upload(body.clone(), key_ref)).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout),
            }
        })
        .await;

        match outcome.result {
            Ok(url) => {
                info!(job_id = %job_id, item_id = %image.item_id, key = %key, "☁️ image stored");
                StoredImage { item_id: image.item_id.clone(), url, permanent: true, error: None }
            }
            Err(e) => fallback(format!("upload of {key} failed after {} attempt(s): {e}", outcome.attempts)),
        }
    }

    /// Uploads every image of a chunk; the permit pool caps how many run at once.
    pub async fn upload_batch(&self, images: &[ImageResult], reporter: &ProgressReporter) -> Vec<StoredImage> {
        let job_id = reporter.job_id();
        join_all(images.iter().map(|image| async move {
            let stored = self.upload(job_id, image).await;
            reporter.report(ProgressUpdate::ImageUploaded { item_id: stored.item_id.clone(), permanent: stored.permanent });
            stored
        }))
        .await
    }
}

pub fn object_key(job_id: JobId, item_id: &ItemId, body: &UploadBody) -> String {
    let ext = match body {
        UploadBody::Bytes { content_type, .. } => extension_for(content_type),
        UploadBody::Url(url) => url
            .rsplit('/')
            .next()
            .and_then(|last| last.split(['?', '#']).next())
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("png"),
    };
    format!("jobs/{job_id}/{item_id}.{}", ext.to_ascii_lowercase())
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        _ => "png",
    }
}
