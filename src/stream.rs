//! Live fan-out of job snapshots.
//!
//! A subscription always opens with the job's current snapshot, then follows
//! the tracker's broadcast channel until the job reaches a terminal phase.
//! Receivers that fall behind skip to newer snapshots instead of holding up
//! the tracker or other subscribers.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::models::JobId;
use crate::progress::{JobProgress, Phase, ProgressTracker};

#[derive(Clone)]
pub struct ProgressStream {
    tracker: Arc<ProgressTracker>,
}

impl ProgressStream {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self { tracker }
    }

    pub fn subscribe(&self, job_id: JobId) -> Result<Subscription, PipelineError> {
        let (snapshot, rx) = self.tracker.subscribe(job_id).ok_or(PipelineError::JobNotFound(job_id))?;
        debug!(job_id = %job_id, phase = ?snapshot.phase, "stream subscriber attached");

        if snapshot.phase.is_terminal() {
            return Ok(Subscription { job_id, inner: stream::once(future::ready(snapshot)).boxed() });
        }

        let live = BroadcastStream::new(rx).filter_map(move |msg| {
            future::ready(match msg {
                Ok(progress) => Some(progress),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(job_id = %job_id, skipped, "subscriber lagged, older snapshots dropped");
                    None
                }
            })
        });
        let snapshots = stream::once(future::ready(snapshot)).chain(live).boxed();
        // ends right after the terminal snapshot without polling the channel again
        let inner = stream::unfold((snapshots, false), |(mut snapshots, done)| async move {
            if done {
                return None;
            }
            let progress = snapshots.next().await?;
            let done = progress.phase.is_terminal();
            Some((progress, (snapshots, done)))
        })
        .boxed();
        Ok(Subscription { job_id, inner })
    }

    /// Detaches a subscriber. The job itself keeps running.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(job_id = %subscription.job_id, "stream subscriber detached");
        drop(subscription);
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.tracker.subscriber_count(job_id)
    }
}

pub struct Subscription {
    job_id: JobId,
    inner: BoxStream<'static, JobProgress>,
}

impl Subscription {
    /// Frames every snapshot as a server-sent event.
    pub fn into_sse(self) -> impl Stream<Item = Result<Event, Infallible>> {
        self.map(|progress| Ok(sse_event(&progress)))
    }
}

impl Stream for Subscription {
    type Item = JobProgress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

pub fn event_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Complete => "complete",
        Phase::Failed => "error",
        _ => "progress",
    }
}

pub fn sse_event(progress: &JobProgress) -> Event {
    let name = event_name(progress.phase);
    Event::default().event(name).json_data(progress).unwrap_or_else(|e| {
        Event::default().event("error").data(format!("failed to encode progress: {e}"))
    })
}
