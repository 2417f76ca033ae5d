//! Job lifecycle: admission, the sequential chunk loop, and final aggregation.
//!
//! Chunks run strictly one after another. Only the imaging stage of a chunk
//! fans out, bounded by the image and upload pools. A chunk that fails is
//! recorded and skipped; the job ends `complete` if any chunk succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::{
    ConceptAgent, ContentGenerationAgent, DuplicateCache, ImageGenerationAgent, ImageStorageAgent, PersistenceAgent,
    ValidationAgent,
};
use crate::clients::{ContentClient, ImageClient, ObjectStore, RecipeStore};
use crate::config::PipelineConfig;
use crate::error::{PersistenceError, PipelineError};
use crate::models::{
    ChunkReport, ChunkSpec, GenerationRequest, ImageOutcome, ItemId, JobId, JobResult, PersistedItemResult,
    SavedItem,
};
use crate::placeholders::PlaceholderPool;
use crate::progress::{AgentKind, AgentStatus, Phase, ProgressReporter, ProgressTracker, ProgressUpdate};

/// External systems one pipeline instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub content: Arc<dyn ContentClient>,
    pub images: Arc<dyn ImageClient>,
    pub objects: Arc<dyn ObjectStore>,
    pub recipes: Arc<dyn RecipeStore>,
}

struct Inner {
    concept: ConceptAgent,
    content: ContentGenerationAgent,
    validation: ValidationAgent,
    persistence: PersistenceAgent,
    image_gen: ImageGenerationAgent,
    image_store: ImageStorageAgent,
    recipes: Arc<dyn RecipeStore>,
    tracker: Arc<ProgressTracker>,
    config: PipelineConfig,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

/// What survives a job-level timeout: everything finished before the budget ran out.
#[derive(Default)]
struct JobRun {
    chunks: Vec<ChunkReport>,
    processed: usize,
    saved_items: Vec<SavedItem>,
    /// Rows committed by the chunk in progress whose imaging has not finished.
    committed: Option<Vec<PersistedItemResult>>,
}

impl Coordinator {
    pub fn new(
        collaborators: Collaborators,
        tracker: Arc<ProgressTracker>,
        placeholders: Arc<PlaceholderPool>,
        config: PipelineConfig,
    ) -> Self {
        let inner = Inner {
            concept: ConceptAgent::new(collaborators.content.clone(), &config),
            content: ContentGenerationAgent::new(collaborators.content, &config),
            validation: ValidationAgent::new(&config),
            persistence: PersistenceAgent::new(collaborators.recipes.clone(), placeholders.clone(), &config),
            image_gen: ImageGenerationAgent::new(collaborators.images, placeholders, &config),
            image_store: ImageStorageAgent::new(collaborators.objects, &config),
            recipes: collaborators.recipes,
            tracker,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.inner.tracker
    }

    /// Validates the request, registers the job and runs it in the background.
    /// Returns as soon as the job exists; nothing is created for a bad request.
    pub fn start(&self, request: GenerationRequest) -> Result<JobId, PipelineError> {
        let job_id = self.admit(&request)?;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(job_id, request).await });

        let tracker = self.inner.tracker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "💥 job task aborted");
                tracker.update(job_id, ProgressUpdate::Error(format!("job aborted: {e}")));
                tracker.update(job_id, ProgressUpdate::Finished { phase: Phase::Failed, result: JobResult::default() });
            }
        });
        Ok(job_id)
    }

    /// Same as [`start`](Self::start) but waits for the job to finish.
    pub async fn execute(&self, request: GenerationRequest) -> Result<(JobId, JobResult), PipelineError> {
        let job_id = self.admit(&request)?;
        let result = self.run(job_id, request).await;
        Ok((job_id, result))
    }

    fn admit(&self, request: &GenerationRequest) -> Result<JobId, PipelineError> {
        self.inner.concept.check(request)?;
        let mut job_id = Uuid::new_v4();
        while !self.inner.tracker.create_job(job_id) {
            job_id = Uuid::new_v4();
        }
        info!(job_id = %job_id, count = request.count, "🚀 job accepted");
        Ok(job_id)
    }

    async fn run(&self, job_id: JobId, request: GenerationRequest) -> JobResult {
        let reporter = self.inner.tracker.reporter(job_id);
        let mut run = JobRun::default();

        let timed_out = match self.inner.config.job_timeout {
            Some(budget) => tokio::time::timeout(budget, self.drive(&reporter, &request, &mut run)).await.is_err(),
            None => {
                self.drive(&reporter, &request, &mut run).await;
                false
            }
        };

        if timed_out {
            let budget = self.inner.config.job_timeout.unwrap_or_default();
            warn!(job_id = %job_id, budget_secs = budget.as_secs(), processed = run.processed, "⏱️ job timed out");
            reporter.error(format!("job timed out after {}s", budget.as_secs()));
            if let Some(items) = run.committed.take() {
                self.settle_committed(&reporter, &mut run, items).await;
            }
            for report in run.chunks.iter_mut().skip(run.processed) {
                report.error.get_or_insert_with(|| "not finished before job timeout".to_string());
            }
        }

        self.finish(&reporter, request.count, run)
    }

    async fn drive(&self, reporter: &ProgressReporter, request: &GenerationRequest, run: &mut JobRun) {
        let inner = &self.inner;
        reporter.report(ProgressUpdate::Phase { phase: Phase::Planning, chunk: None });
        reporter.agent(AgentKind::Concept, AgentStatus::Working);

        let strategy = match inner.concept.plan(request).await {
            Ok(strategy) => strategy,
            Err(e) => {
                reporter.agent(AgentKind::Concept, AgentStatus::Failed);
                reporter.error(e.to_string());
                return;
            }
        };
        if let Some(reason) = &strategy.fallback_reason {
            reporter.error(format!("planning used the default strategy: {reason}"));
        }
        reporter.report(ProgressUpdate::Planned {
            total_chunks: strategy.chunks.len(),
            total_items: strategy.total_items(),
        });
        reporter.agent(AgentKind::Concept, AgentStatus::Complete);

        run.chunks = strategy
            .chunks
            .iter()
            .map(|c| ChunkReport { index: c.index, planned: c.item_count(), ..ChunkReport::default() })
            .collect();

        // lives exactly as long as the job
        let duplicates = DuplicateCache::new(inner.config.url_suffix_len);

        let total = strategy.chunks.len();
        for chunk in &strategy.chunks {
            info!(job_id = %reporter.job_id(), chunk = chunk.index + 1, total, items = chunk.item_count(), "📦 chunk started");
            if let Err(e) = self.process_chunk(reporter, chunk, &duplicates, run).await {
                error!(job_id = %reporter.job_id(), chunk = chunk.index + 1, error = %e, "❌ chunk failed");
                run.chunks[run.processed].error = Some(e.to_string());
                reporter.error(e.to_string());
            }
            reporter.report(ProgressUpdate::ChunkFinished { chunk: chunk.index });
            run.processed += 1;
        }
    }

    async fn process_chunk(
        &self,
        reporter: &ProgressReporter,
        chunk: &ChunkSpec,
        duplicates: &DuplicateCache,
        run: &mut JobRun,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let index = chunk.index;
        let slot = run.processed;
        let phase = |phase: Phase| reporter.report(ProgressUpdate::Phase { phase, chunk: Some(index) });

        phase(Phase::Generating);
        reporter.agent(AgentKind::Content, AgentStatus::Working);
        let items = inner.content.generate_chunk(chunk).await.inspect_err(|_| {
            reporter.agent(AgentKind::Content, AgentStatus::Failed);
        })?;
        reporter.agent(AgentKind::Content, AgentStatus::Complete);
        let report = &mut run.chunks[slot];
        report.generated = items.len();
        reporter.report(ProgressUpdate::ItemsGenerated { chunk: index, count: items.len() });

        phase(Phase::Validating);
        reporter.agent(AgentKind::Validation, AgentStatus::Working);
        let validated = inner.validation.validate(items, &chunk.constraints);
        for rejected in &validated.rejected {
            warn!(job_id = %reporter.job_id(), chunk = index + 1, reason = %rejected.reason, "🚫 item rejected");
            reporter.error(format!("chunk {}: rejected {}", index + 1, rejected.reason));
        }
        report.rejected = validated.rejected.len();
        reporter.agent(AgentKind::Validation, AgentStatus::Complete);
        if validated.valid.is_empty() {
            return Err(PipelineError::AllRejected { chunk: index });
        }

        phase(Phase::Persisting);
        reporter.agent(AgentKind::Persistence, AgentStatus::Working);
        let persisted = inner.persistence.persist(index, &validated.valid).await.inspect_err(|_| {
            reporter.agent(AgentKind::Persistence, AgentStatus::Failed);
        })?;
        reporter.agent(AgentKind::Persistence, AgentStatus::Complete);
        report.persisted = persisted.len();
        reporter.report(ProgressUpdate::ItemsPersisted { chunk: index, ids: persisted.iter().map(|p| p.id.clone()).collect() });
        run.committed = Some(persisted.clone());

        phase(Phase::Imaging);
        reporter.agent(AgentKind::ImageGeneration, AgentStatus::Working);
        let images = inner.image_gen.generate_batch(&persisted, duplicates, reporter).await;
        reporter.agent(AgentKind::ImageGeneration, AgentStatus::Complete);
        for image in &images {
            if let Some(e) = &image.error {
                reporter.error(format!("chunk {}: {e}", index + 1));
            }
        }

        reporter.agent(AgentKind::ImageStorage, AgentStatus::Working);
        let stored = inner.image_store.upload_batch(&images, reporter).await;
        reporter.agent(AgentKind::ImageStorage, AgentStatus::Complete);

        let report = &mut run.chunks[slot];
        report.images_generated = images.iter().filter(|i| i.outcome == ImageOutcome::Generated).count();
        report.images_placeholder = images.iter().filter(|i| i.outcome == ImageOutcome::PlaceholderFallback).count();
        report.images_uploaded = stored.iter().filter(|s| s.permanent).count();

        for ((item, image), stored) in persisted.iter().zip(&images).zip(&stored) {
            if let Some(e) = &stored.error {
                reporter.error(format!("chunk {}: {e}", index + 1));
            }
            if let Err(e) = self.write_back(item, &stored.url).await {
                warn!(job_id = %reporter.job_id(), item_id = %item.id, error = %e, "⚠️ image url write-back failed");
                reporter.error(format!("chunk {}: image url for item {} not saved: {e}", index + 1, item.id));
            }
            run.saved_items.push(SavedItem {
                id: item.id.clone(),
                name: item.name.clone(),
                image_url: stored.url.clone(),
                image_outcome: image.outcome,
            });
        }

        let report = &run.chunks[slot];
        check_health(reporter, report);
        run.committed = None;

        info!(
            job_id = %reporter.job_id(),
            chunk = index + 1,
            persisted = report.persisted,
            images = report.images_generated,
            placeholders = report.images_placeholder,
            uploaded = report.images_uploaded,
            "✅ chunk finished"
        );
        Ok(())
    }

    /// Closes out the chunk the job timeout cut off after its rows were
    /// committed: items still without an image keep their placeholder, which
    /// is written back, and the chunk counts as finished.
    async fn settle_committed(&self, reporter: &ProgressReporter, run: &mut JobRun, items: Vec<PersistedItemResult>) {
        let slot = run.processed;
        let Some(index) = run.chunks.get(slot).map(|r| r.index) else {
            return;
        };
        let saved: HashSet<ItemId> = run.saved_items.iter().map(|s| s.id.clone()).collect();
        let pending: Vec<&PersistedItemResult> = items.iter().filter(|i| !saved.contains(&i.id)).collect();
        warn!(job_id = %reporter.job_id(), chunk = index + 1, pending = pending.len(), "⏱️ committed chunk settled with placeholders");

        for item in pending {
            reporter.report(ProgressUpdate::ImageGenerated { item_id: item.id.clone(), outcome: ImageOutcome::PlaceholderFallback });
            if let Err(e) = self.write_back(item, &item.image_url).await {
                reporter.error(format!("chunk {}: image url for item {} not saved: {e}", index + 1, item.id));
            }
            run.saved_items.push(SavedItem {
                id: item.id.clone(),
                name: item.name.clone(),
                image_url: item.image_url.clone(),
                image_outcome: ImageOutcome::PlaceholderFallback,
            });
        }

        let ids: HashSet<&ItemId> = items.iter().map(|i| &i.id).collect();
        let outcomes: Vec<ImageOutcome> =
            run.saved_items.iter().filter(|s| ids.contains(&s.id)).map(|s| s.image_outcome).collect();
        let report = &mut run.chunks[slot];
        report.images_generated = outcomes.iter().filter(|o| **o == ImageOutcome::Generated).count();
        report.images_placeholder = outcomes.iter().filter(|o| **o == ImageOutcome::PlaceholderFallback).count();
        check_health(reporter, report);

        reporter.report(ProgressUpdate::ChunkFinished { chunk: index });
        run.processed += 1;
    }

    async fn write_back(&self, item: &PersistedItemResult, url: &str) -> Result<(), PersistenceError> {
        let budget = self.inner.config.persistence_timeout;
        match tokio::time::timeout(budget, self.inner.recipes.update_image(&item.id, url)).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout),
        }
    }

    fn finish(&self, reporter: &ProgressReporter, requested: usize, run: JobRun) -> JobResult {
        let succeeded = run.chunks.iter().filter(|c| c.succeeded()).count();
        let phase = if succeeded > 0 { Phase::Complete } else { Phase::Failed };
        let errors = self.inner.tracker.get(reporter.job_id()).map(|p| p.errors).unwrap_or_default();

        let result = JobResult {
            requested,
            generated: run.chunks.iter().map(|c| c.generated).sum(),
            persisted: run.chunks.iter().map(|c| c.persisted).sum(),
            images_generated: run.chunks.iter().map(|c| c.images_generated).sum(),
            images_placeholder: run.chunks.iter().map(|c| c.images_placeholder).sum(),
            images_uploaded: run.chunks.iter().map(|c| c.images_uploaded).sum(),
            degraded: !errors.is_empty(),
            errors,
            saved_items: run.saved_items,
            chunks: run.chunks,
        };

        match phase {
            Phase::Complete => info!(
                job_id = %reporter.job_id(),
                chunks_ok = succeeded,
                chunks = result.chunks.len(),
                persisted = result.persisted,
                images = result.images_generated,
                degraded = result.degraded,
                "🏁 job complete"
            ),
            _ => error!(job_id = %reporter.job_id(), errors = result.errors.len(), "💥 job failed, no chunk succeeded"),
        }
        reporter.report(ProgressUpdate::Finished { phase, result: result.clone() });
        result
    }
}

/// A chunk that saved items but produced no real image is a pipeline health event.
fn check_health(reporter: &ProgressReporter, report: &ChunkReport) {
    if report.images_generated == 0 && report.persisted > 0 {
        reporter.report(ProgressUpdate::Critical {
            chunk: report.index,
            message: format!(
                "{} items persisted but 0 real images generated ({} placeholders)",
                report.persisted, report.images_placeholder
            ),
        });
    }
}
