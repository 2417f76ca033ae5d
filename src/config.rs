use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::retry::{Backoff, RetryPolicy};

/// Tuning knobs for one pipeline instance. Defaults match the production
/// deployment; every field can be overridden with a `BMAD_*` variable.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_items: usize,
    pub chunk_size: usize,
    pub image_concurrency: usize,
    pub upload_concurrency: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub planning_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub content_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub image_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upload_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub persistence_timeout: Duration,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub job_timeout: Option<Duration>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retention: Duration,
    pub max_image_attempts: u32,
    pub content_attempts: u32,
    pub upload_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff_max: Duration,
    /// Largest relative rescale the validator may apply, e.g. 0.5 allows 0.5x..1.5x.
    pub autofix_tolerance: f64,
    pub url_suffix_len: usize,
    pub stream_buffer: usize,
    pub diagnostics_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_items: 100,
            chunk_size: 5,
            image_concurrency: 5,
            upload_concurrency: 5,
            planning_timeout: Duration::from_secs(20),
            content_timeout: Duration::from_secs(60),
            image_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(30),
            persistence_timeout: Duration::from_secs(30),
            job_timeout: Some(Duration::from_secs(30 * 60)),
            retention: Duration::from_secs(60 * 60),
            max_image_attempts: 3,
            content_attempts: 2,
            upload_attempts: 2,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(5),
            autofix_tolerance: 0.5,
            url_suffix_len: 32,
            stream_buffer: 64,
            diagnostics_capacity: 100,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        override_from_env("BMAD_MAX_ITEMS", &mut cfg.max_items);
        override_from_env("BMAD_CHUNK_SIZE", &mut cfg.chunk_size);
        override_from_env("BMAD_IMAGE_CONCURRENCY", &mut cfg.image_concurrency);
        override_from_env("BMAD_UPLOAD_CONCURRENCY", &mut cfg.upload_concurrency);
        override_secs("BMAD_PLANNING_TIMEOUT_SECS", &mut cfg.planning_timeout);
        override_secs("BMAD_CONTENT_TIMEOUT_SECS", &mut cfg.content_timeout);
        override_secs("BMAD_IMAGE_TIMEOUT_SECS", &mut cfg.image_timeout);
        override_secs("BMAD_UPLOAD_TIMEOUT_SECS", &mut cfg.upload_timeout);
        override_secs("BMAD_PERSISTENCE_TIMEOUT_SECS", &mut cfg.persistence_timeout);
        override_secs("BMAD_RETENTION_SECS", &mut cfg.retention);
        if let Ok(raw) = std::env::var("BMAD_JOB_TIMEOUT_SECS") {
            // 0 disables the job-level budget
            match raw.parse::<u64>() {
                Ok(0) => cfg.job_timeout = None,
                Ok(secs) => cfg.job_timeout = Some(Duration::from_secs(secs)),
                Err(_) => tracing::warn!(value = %raw, "ignoring unparsable BMAD_JOB_TIMEOUT_SECS"),
            }
        }
        override_from_env("BMAD_MAX_IMAGE_ATTEMPTS", &mut cfg.max_image_attempts);
        override_from_env("BMAD_CONTENT_ATTEMPTS", &mut cfg.content_attempts);
        override_from_env("BMAD_UPLOAD_ATTEMPTS", &mut cfg.upload_attempts);
        override_from_env("BMAD_AUTOFIX_TOLERANCE", &mut cfg.autofix_tolerance);
        override_from_env("BMAD_URL_SUFFIX_LEN", &mut cfg.url_suffix_len);
        override_from_env("BMAD_STREAM_BUFFER", &mut cfg.stream_buffer);
        override_from_env("BMAD_DIAGNOSTICS_CAPACITY", &mut cfg.diagnostics_capacity);
        cfg
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::Exponential { base: self.retry_backoff, max: self.retry_backoff_max }
    }

    pub fn content_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.content_attempts, self.backoff())
    }

    pub fn image_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_image_attempts, self.backoff())
    }

    pub fn upload_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.upload_attempts, self.backoff())
    }
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}

fn override_secs(key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    override_from_env(key, &mut secs);
    *slot = Duration::from_secs(secs);
}
