use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::clients::{ObjectStore, UploadBody};
use crate::error::StorageError;

/// S3-style bucket reachable with authenticated `PUT {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
    public_base: String,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        token: Option<String>,
        public_base: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let public_base = public_base.unwrap_or_else(|| format!("{}/{}", endpoint, bucket));
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, endpoint, bucket, token, public_base })
    }

    async fn fetch(&self, url: &str) -> Result<(String, Bytes), StorageError> {
        let response = self.client.get(url).send().await.map_err(map_transport)?;
        if !response.status().is_success() {
            return Err(StorageError::Other(format!("source fetch failed: status={}", response.status())));
        }
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await.map_err(map_transport)?;
        let content_type = header_type.unwrap_or_else(|| content_type_for(&data));
        Ok((content_type, data))
    }
}

pub fn content_type_for(data: &[u8]) -> String {
    match image::guess_format(data) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) if data.starts_with(b"<svg") || data.starts_with(b"<?xml") => "image/svg+xml".to_string(),
        Err(_) => "application/octet-stream".to_string(),
    }
}

fn map_transport(e: reqwest::Error) -> StorageError {
    if e.is_timeout() { StorageError::Timeout } else { StorageError::Other(e.to_string()) }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, body: UploadBody, key: &str) -> Result<String, StorageError> {
        let (content_type, data) = match body {
            UploadBody::Bytes { content_type, data } => (content_type, data),
            UploadBody::Url(url) => self.fetch(&url).await?,
        };
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        info!("📤 Uploading {} bytes to {}", data.len(), url);
        let mut request = self.client.put(&url).header(reqwest::header::CONTENT_TYPE, content_type).body(data);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_transport)?;
        match response.status() {
            s if s.is_success() => Ok(format!("{}/{}", self.public_base.trim_end_matches('/'), key)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StorageError::Unauthorized),
            StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => Err(StorageError::QuotaExceeded),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(StorageError::Timeout),
            s => {
                let text = response.text().await.unwrap_or_default();
                warn!("❌ Object store rejected upload: status={} body={}", s, text);
                Err(StorageError::Other(format!("status={} body={}", s, text)))
            }
        }
    }
}
