use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

use crate::models::JobId;

/// Marks which client failures the shared retry helper may try again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContentError {
    #[error("content API rate limited")] RateLimited,
    #[error("content API timed out")] Timeout,
    #[error("invalid content response: {0}")] InvalidResponse(String),
    #[error("HTTP error: {0}")] Http(String),
}

impl Retryable for ContentError {
    fn is_retryable(&self) -> bool {
        matches!(self, ContentError::RateLimited | ContentError::Timeout | ContentError::Http(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ImageApiError {
    #[error("image API rate limited")] RateLimited,
    #[error("image API timed out")] Timeout,
    #[error("content policy violation: {0}")] ContentPolicyViolation(String),
    #[error("HTTP error: {0}")] Http(String),
    #[error("duplicate image returned")] Duplicate,
}

impl Retryable for ImageApiError {
    fn is_retryable(&self) -> bool {
        // a policy rejection will be rejected again for the same prompt
        !matches!(self, ImageApiError::ContentPolicyViolation(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("object store rejected credentials")] Unauthorized,
    #[error("object store upload timed out")] Timeout,
    #[error("object store quota exceeded")] QuotaExceeded,
    #[error("object store error: {0}")] Other(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Timeout | StorageError::Other(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("constraint violation: {0}")] ConstraintViolation(String),
    #[error("connection failure: {0}")] Connection(String),
    #[error("persistence transaction timed out")] Timeout,
    #[error("persisted result lost field: {0}")] FieldLoss(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    // chunk indexes are 0-based; messages are read by people
    #[error("chunk {}: generation failed: {source}", .chunk + 1)]
    Generation { chunk: usize, #[source] source: ContentError },
    #[error("chunk {}: every generated item was rejected", .chunk + 1)]
    AllRejected { chunk: usize },
    #[error("chunk {}: persistence failed: {source}", .chunk + 1)]
    Persistence { chunk: usize, #[source] source: PersistenceError },
}

/// HTTP-facing error. Only request-level failures and lookups surface here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)] Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Pipeline(PipelineError::InvalidRequest(_)) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Pipeline(PipelineError::JobNotFound(_)) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
            ApiError::Pipeline(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}
