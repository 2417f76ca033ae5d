//! Scripted collaborators for driving the whole pipeline in-process.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use bmad_pipeline::clients::memory::{InMemoryObjectStore, InMemoryRecipeStore};
use bmad_pipeline::clients::{ContentClient, ImageClient, NewRecipe, ObjectStore, RecipeStore, UploadBody};
use bmad_pipeline::error::{ContentError, ImageApiError, PersistenceError, StorageError};
use bmad_pipeline::models::{ChunkSpec, GeneratedItem, GenerationRequest, ItemId, JobId};
use bmad_pipeline::placeholders::PlaceholderPool;
use bmad_pipeline::{Collaborators, Coordinator, JobProgress, PipelineConfig, ProgressTracker};

/// Content API double. Items are named after their planned concept unless
/// `same_name` is set; `calories` is cycled over item positions.
#[derive(Default)]
pub struct ScriptedContent {
    pub failing_chunks: HashSet<usize>,
    pub same_name: Option<String>,
    pub calories: Vec<f64>,
    /// Chunk that waits for a permit before answering.
    pub gate: Option<(usize, Arc<Semaphore>)>,
    pub calls: AtomicU32,
}

#[async_trait]
impl ContentClient for ScriptedContent {
    async fn plan_concepts(&self, request: &GenerationRequest) -> Result<Vec<String>, ContentError> {
        Ok((1..=request.count).map(|n| format!("Test dish {n}")).collect())
    }

    async fn generate_items(&self, chunk: &ChunkSpec) -> Result<Vec<GeneratedItem>, ContentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((index, gate)) = &self.gate {
            if *index == chunk.index {
                let _permit = gate.acquire().await.map_err(|e| ContentError::Http(e.to_string()))?;
            }
        }
        if self.failing_chunks.contains(&chunk.index) {
            return Err(ContentError::Http("503 upstream unavailable".into()));
        }
        Ok(chunk
            .items
            .iter()
            .enumerate()
            .map(|(pos, params)| {
                let mut attributes = BTreeMap::new();
                if !self.calories.is_empty() {
                    attributes.insert("calories".to_string(), self.calories[pos % self.calories.len()]);
                }
                attributes.insert("protein_g".to_string(), 20.0);
                GeneratedItem {
                    name: self.same_name.clone().unwrap_or_else(|| params.concept.clone()),
                    description: format!("{} with seasonal vegetables", params.concept),
                    categories: params.categories.clone(),
                    attributes,
                }
            })
            .collect())
    }
}

pub enum ImageMode {
    Unique,
    SameUrl(String),
    AlwaysFail,
}

pub struct ScriptedImages {
    pub mode: ImageMode,
    pub delay: Duration,
    pub calls: AtomicU32,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedImages {
    pub fn new(mode: ImageMode) -> Self {
        Self { mode, delay: Duration::ZERO, calls: AtomicU32::new(0), in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ImageClient for ScriptedImages {
    async fn generate_image(&self, _prompt: &str) -> Result<String, ImageApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &self.mode {
            ImageMode::Unique => Ok(format!("https://images.example.com/tmp/{}.png", Uuid::new_v4())),
            ImageMode::SameUrl(url) => Ok(url.clone()),
            ImageMode::AlwaysFail => Err(ImageApiError::RateLimited),
        }
    }
}

/// Recipe store whose `fail_batch`-th insert (0-based) fails with a
/// connection error and commits nothing. With `fail_updates` every image
/// write-back fails.
pub struct FlakyRecipes {
    pub inner: InMemoryRecipeStore,
    pub fail_batch: Option<usize>,
    pub fail_updates: bool,
    batches: AtomicUsize,
}

impl FlakyRecipes {
    pub fn new(fail_batch: Option<usize>) -> Self {
        Self { inner: InMemoryRecipeStore::new(), fail_batch, fail_updates: false, batches: AtomicUsize::new(0) }
    }

    pub fn failing_updates() -> Self {
        Self { fail_updates: true, ..Self::new(None) }
    }
}

#[async_trait]
impl RecipeStore for FlakyRecipes {
    async fn insert_batch(&self, rows: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError> {
        let n = self.batches.fetch_add(1, Ordering::SeqCst);
        if Some(n) == self.fail_batch {
            return Err(PersistenceError::Connection("connection reset by peer".into()));
        }
        self.inner.insert_batch(rows).await
    }

    async fn update_image(&self, id: &ItemId, url: &str) -> Result<(), PersistenceError> {
        if self.fail_updates {
            return Err(PersistenceError::Connection("connection reset by peer".into()));
        }
        self.inner.update_image(id, url).await
    }
}

/// Object store that records how many uploads overlap.
pub struct GaugedObjects {
    pub inner: InMemoryObjectStore,
    pub delay: Duration,
    pub quota_exceeded: bool,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl GaugedObjects {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryObjectStore::new("memory://bucket"),
            delay,
            quota_exceeded: false,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn over_quota() -> Self {
        Self { quota_exceeded: true, ..Self::new(Duration::ZERO) }
    }
}

#[async_trait]
impl ObjectStore for GaugedObjects {
    async fn upload(&self, body: UploadBody, key: &str) -> Result<String, StorageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.quota_exceeded {
            return Err(StorageError::QuotaExceeded);
        }
        self.inner.upload(body, key).await
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig { retry_backoff: Duration::ZERO, ..PipelineConfig::default() }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub content: Arc<ScriptedContent>,
    pub images: Arc<ScriptedImages>,
    pub recipes: Arc<FlakyRecipes>,
    pub objects: Arc<GaugedObjects>,
}

impl Harness {
    pub fn new(content: ScriptedContent, images: ScriptedImages, recipes: FlakyRecipes, objects: GaugedObjects, config: PipelineConfig) -> Self {
        let content = Arc::new(content);
        let images = Arc::new(images);
        let recipes = Arc::new(recipes);
        let objects = Arc::new(objects);
        let collaborators = Collaborators {
            content: content.clone(),
            images: images.clone(),
            objects: objects.clone(),
            recipes: recipes.clone(),
        };
        let tracker = Arc::new(ProgressTracker::new(&config));
        let coordinator = Coordinator::new(collaborators, tracker, Arc::new(PlaceholderPool::embedded()), config);
        Self { coordinator, content, images, recipes, objects }
    }

    pub fn simple(content: ScriptedContent, images: ScriptedImages) -> Self {
        Self::new(content, images, FlakyRecipes::new(None), GaugedObjects::new(Duration::ZERO), test_config())
    }

    pub fn progress(&self, job_id: JobId) -> JobProgress {
        self.coordinator.tracker().get(job_id).expect("job should still be tracked")
    }

    /// Polls until `done` holds for the job's snapshot.
    pub async fn wait_for(&self, job_id: JobId, done: impl Fn(&JobProgress) -> bool) -> JobProgress {
        for _ in 0..500 {
            let progress = self.progress(job_id);
            if done(&progress) {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state: {:?}", self.progress(job_id));
    }
}

pub fn request(count: usize) -> GenerationRequest {
    GenerationRequest { count, categories: vec![], constraints: BTreeMap::new(), goal: None }
}
