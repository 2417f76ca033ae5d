//! Process-wide registry of in-flight jobs.
//!
//! Agents never touch [`JobProgress`] directly; they report facts through a
//! [`ProgressReporter`] and the tracker folds them into per-job state under a
//! single lock. Facts are keyed by chunk index or item id so replaying one
//! does not inflate any counter.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::models::{ImageOutcome, ItemId, JobId, JobResult};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Generating,
    Validating,
    Persisting,
    Imaging,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Concept,
    Content,
    Validation,
    Persistence,
    ImageGeneration,
    ImageStorage,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Concept,
        AgentKind::Content,
        AgentKind::Validation,
        AgentKind::Persistence,
        AgentKind::ImageGeneration,
        AgentKind::ImageStorage,
    ];
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Complete,
    Failed,
}

/// Snapshot of one job as seen by pollers and stream subscribers.
#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobProgress {
    pub job_id: JobId,
    pub phase: Phase,
    pub current_chunk: Option<usize>,
    pub total_chunks: usize,
    pub chunks_completed: usize,
    pub items_total: usize,
    pub items_generated: usize,
    pub items_completed: usize,
    /// Real AI images only; placeholder fallbacks are counted separately.
    pub images_generated: usize,
    pub images_placeholder: usize,
    pub images_failed: usize,
    /// Permanent uploads only.
    pub images_uploaded: usize,
    pub errors: Vec<String>,
    pub agents: BTreeMap<AgentKind, AgentStatus>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub eta_seconds: Option<u64>,
    pub result: Option<JobResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Planned { total_chunks: usize, total_items: usize },
    Phase { phase: Phase, chunk: Option<usize> },
    Agent { agent: AgentKind, status: AgentStatus },
    ItemsGenerated { chunk: usize, count: usize },
    ItemsPersisted { chunk: usize, ids: Vec<ItemId> },
    ImageGenerated { item_id: ItemId, outcome: ImageOutcome },
    ImageUploaded { item_id: ItemId, permanent: bool },
    ChunkFinished { chunk: usize },
    Error(String),
    /// Health-signal event; lands in the job's errors and the diagnostics ring.
    Critical { chunk: usize, message: String },
    Finished { phase: Phase, result: JobResult },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealthEvent {
    pub job_id: JobId,
    pub chunk: usize,
    pub message: String,
    pub at: DateTime<Utc>,
}

struct JobState {
    phase: Phase,
    current_chunk: Option<usize>,
    total_chunks: usize,
    items_total: usize,
    generated: BTreeMap<usize, usize>,
    persisted: BTreeMap<usize, BTreeSet<ItemId>>,
    images: BTreeMap<ItemId, ImageOutcome>,
    uploads: BTreeSet<ItemId>,
    chunks_done: BTreeSet<usize>,
    errors: Vec<String>,
    agents: BTreeMap<AgentKind, AgentStatus>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<JobResult>,
}

impl JobState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: Phase::Planning,
            current_chunk: None,
            total_chunks: 0,
            items_total: 0,
            generated: BTreeMap::new(),
            persisted: BTreeMap::new(),
            images: BTreeMap::new(),
            uploads: BTreeSet::new(),
            chunks_done: BTreeSet::new(),
            errors: Vec::new(),
            agents: AgentKind::ALL.iter().map(|a| (*a, AgentStatus::Idle)).collect(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            result: None,
        }
    }

    fn apply(&mut self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Planned { total_chunks, total_items } => {
                self.total_chunks = total_chunks;
                self.items_total = total_items;
            }
            ProgressUpdate::Phase { phase, chunk } => {
                self.phase = phase;
                if chunk.is_some() {
                    self.current_chunk = chunk;
                }
            }
            ProgressUpdate::Agent { agent, status } => {
                self.agents.insert(agent, status);
            }
            ProgressUpdate::ItemsGenerated { chunk, count } => {
                self.generated.insert(chunk, count);
            }
            ProgressUpdate::ItemsPersisted { chunk, ids } => {
                self.persisted.entry(chunk).or_default().extend(ids);
            }
            ProgressUpdate::ImageGenerated { item_id, outcome } => {
                self.images.insert(item_id, outcome);
            }
            ProgressUpdate::ImageUploaded { item_id, permanent } => {
                if permanent {
                    self.uploads.insert(item_id);
                }
            }
            ProgressUpdate::ChunkFinished { chunk } => {
                self.chunks_done.insert(chunk);
            }
            ProgressUpdate::Error(message) => self.errors.push(message),
            ProgressUpdate::Critical { chunk, message } => {
                self.errors.push(format!("CRITICAL chunk {}: {}", chunk + 1, message));
            }
            ProgressUpdate::Finished { phase, result } => {
                self.phase = phase;
                self.current_chunk = None;
                self.finished_at = Some(Utc::now());
                self.result = Some(result);
            }
        }
        self.updated_at = Utc::now();
    }

    fn count_images(&self, wanted: ImageOutcome) -> usize {
        self.images.values().filter(|o| **o == wanted).count()
    }

    fn eta_seconds(&self) -> Option<u64> {
        if self.phase.is_terminal() || self.total_chunks == 0 {
            return None;
        }
        let done = self.chunks_done.len();
        if done == 0 {
            return None;
        }
        let elapsed = (self.updated_at - self.started_at).num_milliseconds().max(0) as u64;
        let per_chunk = elapsed / done as u64;
        Some(per_chunk * self.total_chunks.saturating_sub(done) as u64 / 1000)
    }

    fn snapshot(&self, job_id: JobId) -> JobProgress {
        JobProgress {
            job_id,
            phase: self.phase,
            current_chunk: self.current_chunk,
            total_chunks: self.total_chunks,
            chunks_completed: self.chunks_done.len(),
            items_total: self.items_total,
            items_generated: self.generated.values().sum(),
            items_completed: self.persisted.values().map(BTreeSet::len).sum(),
            images_generated: self.count_images(ImageOutcome::Generated),
            images_placeholder: self.count_images(ImageOutcome::PlaceholderFallback),
            images_failed: self.count_images(ImageOutcome::Failed),
            images_uploaded: self.uploads.len(),
            errors: self.errors.clone(),
            agents: self.agents.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            eta_seconds: self.eta_seconds(),
            result: self.result.clone(),
        }
    }
}

struct JobEntry {
    state: JobState,
    tx: broadcast::Sender<JobProgress>,
    finished: Option<Instant>,
}

pub struct ProgressTracker {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    diagnostics: Mutex<VecDeque<HealthEvent>>,
    diagnostics_capacity: usize,
    stream_buffer: usize,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            diagnostics: Mutex::new(VecDeque::new()),
            diagnostics_capacity: config.diagnostics_capacity.max(1),
            stream_buffer: config.stream_buffer.max(1),
            retention: config.retention,
        }
    }

    /// Registers a job in `planning`. Returns false if the id is already taken.
    pub fn create_job(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&id) {
            return false;
        }
        let (tx, _rx) = broadcast::channel(self.stream_buffer);
        jobs.insert(id, JobEntry { state: JobState::new(), tx, finished: None });
        debug!(job_id = %id, "job registered");
        true
    }

    /// Applies one fact and fans the new snapshot out to subscribers.
    /// Returns `None` for unknown or evicted jobs.
    pub fn update(&self, id: JobId, update: ProgressUpdate) -> Option<JobProgress> {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(&id) else {
            debug!(job_id = %id, "update for unknown job dropped");
            return None;
        };
        if entry.state.phase.is_terminal() {
            warn!(job_id = %id, ?update, "update after terminal phase ignored");
            return Some(entry.state.snapshot(id));
        }
        if let ProgressUpdate::Critical { chunk, message } = &update {
            error!(job_id = %id, chunk, message = %message, "🚨 critical pipeline health event");
            self.push_diagnostic(HealthEvent { job_id: id, chunk: *chunk, message: message.clone(), at: Utc::now() });
        }
        if matches!(update, ProgressUpdate::Finished { .. }) {
            entry.finished = Some(Instant::now());
        }
        entry.state.apply(update);
        let snapshot = entry.state.snapshot(id);
        // never blocks; lagging receivers lose the oldest snapshots
        let _ = entry.tx.send(snapshot.clone());
        Some(snapshot)
    }

    pub fn get(&self, id: JobId) -> Option<JobProgress> {
        self.jobs.read().get(&id).map(|e| e.state.snapshot(id))
    }

    /// Current snapshot plus a receiver for every later one, taken under the
    /// same lock so nothing falls between them.
    pub fn subscribe(&self, id: JobId) -> Option<(JobProgress, broadcast::Receiver<JobProgress>)> {
        let jobs = self.jobs.read();
        let entry = jobs.get(&id)?;
        Some((entry.state.snapshot(id), entry.tx.subscribe()))
    }

    pub fn subscriber_count(&self, id: JobId) -> usize {
        self.jobs.read().get(&id).map_or(0, |e| e.tx.receiver_count())
    }

    /// Drops the job. Open streams see their channel close.
    pub fn evict(&self, id: JobId) -> bool {
        self.jobs.write().remove(&id).is_some()
    }

    /// Evicts terminal jobs whose retention window has elapsed at `now`.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, e| match e.finished {
            Some(at) => now.saturating_duration_since(at) < self.retention,
            None => true,
        });
        before - jobs.len()
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.read().values().filter(|e| !e.state.phase.is_terminal()).count()
    }

    pub fn diagnostics(&self) -> Vec<HealthEvent> {
        self.diagnostics.lock().iter().cloned().collect()
    }

    pub fn reporter(self: &Arc<Self>, job_id: JobId) -> ProgressReporter {
        ProgressReporter { tracker: Arc::clone(self), job_id }
    }

    fn push_diagnostic(&self, event: HealthEvent) {
        let mut ring = self.diagnostics.lock();
        if ring.len() == self.diagnostics_capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }
}

/// Job-scoped handle agents use to report facts.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn report(&self, update: ProgressUpdate) {
        self.tracker.update(self.job_id, update);
    }

    pub fn agent(&self, agent: AgentKind, status: AgentStatus) {
        self.report(ProgressUpdate::Agent { agent, status });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.report(ProgressUpdate::Error(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn tracker() -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(&PipelineConfig::default()))
    }

    #[test]
    fn new_job_starts_in_planning_with_idle_agents() {
        let t = tracker();
        let id = Uuid::new_v4();
        assert!(t.create_job(id));
        assert!(!t.create_job(id));
        let p = t.get(id).unwrap();
        assert_eq!(p.phase, Phase::Planning);
        assert!(p.agents.values().all(|s| *s == AgentStatus::Idle));
    }

    #[test]
    fn replayed_facts_do_not_double_count() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.create_job(id);
        let ids: Vec<ItemId> = vec!["1".into(), "2".into()];
        for _ in 0..2 {
            t.update(id, ProgressUpdate::ItemsGenerated { chunk: 0, count: 2 });
            t.update(id, ProgressUpdate::ItemsPersisted { chunk: 0, ids: ids.clone() });
            t.update(id, ProgressUpdate::ImageGenerated { item_id: "1".into(), outcome: ImageOutcome::Generated });
            t.update(id, ProgressUpdate::ImageUploaded { item_id: "1".into(), permanent: true });
        }
        let p = t.get(id).unwrap();
        assert_eq!(p.items_generated, 2);
        assert_eq!(p.items_completed, 2);
        assert_eq!(p.images_generated, 1);
        assert_eq!(p.images_uploaded, 1);
    }

    #[test]
    fn placeholders_and_temporary_uploads_are_not_real_counts() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.create_job(id);
        t.update(id, ProgressUpdate::ImageGenerated { item_id: "a".into(), outcome: ImageOutcome::PlaceholderFallback });
        t.update(id, ProgressUpdate::ImageUploaded { item_id: "a".into(), permanent: false });
        let p = t.get(id).unwrap();
        assert_eq!((p.images_generated, p.images_placeholder, p.images_uploaded), (0, 1, 0));
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.create_job(id);
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let item_id = ItemId::from(format!("{w}-{i}"));
                        t.update(id, ProgressUpdate::ImageGenerated { item_id, outcome: ImageOutcome::Generated });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.get(id).unwrap().images_generated, 400);
    }

    #[test]
    fn critical_events_reach_errors_and_diagnostics() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.create_job(id);
        t.update(id, ProgressUpdate::Critical { chunk: 1, message: "0 images".into() });
        let p = t.get(id).unwrap();
        assert_eq!(p.errors, vec!["CRITICAL chunk 2: 0 images".to_string()]);
        let diag = t.diagnostics();
        assert_eq!(diag.len(), 1);
        assert_eq!(diag[0].job_id, id);
    }

    #[test]
    fn diagnostics_ring_is_bounded() {
        let cfg = PipelineConfig { diagnostics_capacity: 2, ..PipelineConfig::default() };
        let t = ProgressTracker::new(&cfg);
        let id = Uuid::new_v4();
        t.create_job(id);
        for chunk in 0..3 {
            t.update(id, ProgressUpdate::Critical { chunk, message: "x".into() });
        }
        let chunks: Vec<usize> = t.diagnostics().iter().map(|e| e.chunk).collect();
        assert_eq!(chunks, vec![1, 2]);
    }

    #[test]
    fn terminal_phase_is_sticky() {
        let t = tracker();
        let id = Uuid::new_v4();
        t.create_job(id);
        t.update(id, ProgressUpdate::Finished { phase: Phase::Complete, result: JobResult::default() });
        t.update(id, ProgressUpdate::Phase { phase: Phase::Generating, chunk: Some(0) });
        let p = t.get(id).unwrap();
        assert_eq!(p.phase, Phase::Complete);
        assert!(p.finished_at.is_some());
    }

    #[test]
    fn only_expired_terminal_jobs_are_evicted() {
        let t = tracker();
        let (running, done) = (Uuid::new_v4(), Uuid::new_v4());
        t.create_job(running);
        t.create_job(done);
        t.update(done, ProgressUpdate::Finished { phase: Phase::Failed, result: JobResult::default() });
        assert_eq!(t.evict_expired(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(60 * 60 + 1);
        assert_eq!(t.evict_expired(later), 1);
        assert!(t.get(done).is_none());
        assert!(t.get(running).is_some());
        assert!(t.evict(running));
        assert!(!t.evict(running));
    }
}
