use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::{ApiError, PipelineError};
use crate::models::GenerationRequest;
use crate::progress::{HealthEvent, JobProgress};
use crate::stream::ProgressStream;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub streams: ProgressStream,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        let streams = ProgressStream::new(coordinator.tracker().clone());
        Self { coordinator, streams }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(start_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/stream", get(stream_job))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/health", get(health))
        .with_state(state)
}

pub async fn start_job(
    State(state): State<AppState>,
    Json(body): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    tracing::info!("🎯 Batch requested: {} items, categories {:?}", body.count, body.categories);
    let job_id = state.coordinator.start(body)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

pub async fn get_job(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<JobProgress>, ApiError> {
    let progress = state.coordinator.tracker().get(id).ok_or(PipelineError::JobNotFound(id))?;
    Ok(Json(progress))
}

/// First event is the current snapshot; the stream closes after the terminal one.
/// Dropping the connection only detaches this subscriber.
pub async fn stream_job(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.streams.subscribe(id)?;
    tracing::info!("📡 Stream opened for job {} ({} subscribers)", id, state.streams.subscriber_count(id));
    Ok(Sse::new(subscription.into_sse()).keep_alive(KeepAlive::default()))
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<Vec<HealthEvent>> {
    Json(state.coordinator.tracker().diagnostics())
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "active_jobs": state.coordinator.tracker().active_jobs() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{InMemoryObjectStore, InMemoryRecipeStore};
    use crate::clients::{ContentClient, ImageClient};
    use crate::config::PipelineConfig;
    use crate::coordinator::Collaborators;
    use crate::error::{ContentError, ImageApiError};
    use crate::models::{ChunkSpec, GeneratedItem};
    use crate::placeholders::PlaceholderPool;
    use crate::progress::{Phase, ProgressTracker};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Kitchen;

    #[async_trait]
    impl ContentClient for Kitchen {
        async fn plan_concepts(&self, _: &GenerationRequest) -> Result<Vec<String>, ContentError> {
            Ok(vec![])
        }
        async fn generate_items(&self, chunk: &ChunkSpec) -> Result<Vec<GeneratedItem>, ContentError> {
            Ok(chunk
                .items
                .iter()
                .map(|p| GeneratedItem {
                    name: p.concept.clone(),
                    description: "Simple and quick".into(),
                    categories: p.categories.clone(),
                    attributes: BTreeMap::new(),
                })
                .collect())
        }
    }

    #[async_trait]
    impl ImageClient for Kitchen {
        async fn generate_image(&self, _: &str) -> Result<String, ImageApiError> {
            Ok(format!("https://images.example.com/tmp/{}.png", Uuid::new_v4()))
        }
    }

    fn app() -> (Router, AppState) {
        let config = PipelineConfig::default();
        let collaborators = Collaborators {
            content: Arc::new(Kitchen),
            images: Arc::new(Kitchen),
            objects: Arc::new(InMemoryObjectStore::new("memory://bucket")),
            recipes: Arc::new(InMemoryRecipeStore::new()),
        };
        let tracker = Arc::new(ProgressTracker::new(&config));
        let coordinator = Coordinator::new(collaborators, tracker, Arc::new(PlaceholderPool::embedded()), config);
        let state = AppState::new(coordinator);
        (router(state.clone()), state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn job_is_accepted_then_pollable() {
        let (app, state) = app();
        let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({ "count": 2 }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id: Uuid = body["job_id"].as_str().unwrap().parse().unwrap();

        let mut phase = Phase::Planning;
        for _ in 0..200 {
            phase = state.coordinator.tracker().get(id).unwrap().phase;
            if phase.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(phase, Phase::Complete);

        let (status, body) = send(&app, "GET", &format!("/api/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items_completed"], 2);
        assert_eq!(body["phase"], "complete");
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_without_a_job() {
        let (app, state) = app();
        let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({ "count": 500 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_REQUEST");
        assert_eq!(state.coordinator.tracker().active_jobs(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", &format!("/api/jobs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "JOB_NOT_FOUND");
        let (status, _) = send(&app, "GET", &format!("/api/jobs/{}/stream", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_status() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "active_jobs": 0 }));
    }
}
