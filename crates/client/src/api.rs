//! REST and event-stream client for the analysis API.
//!
//! Wraps the HTTP endpoints (batch processing stream, project progress
//! stream, status polls) using [`reqwest`].

use futures::StreamExt;
use plansight_core::error::ErrorKind;
use plansight_core::event_names::PHASE_BATCH;
use reqwest::header::{ACCEPT, CACHE_CONTROL};

use crate::messages::{BatchStatusCounts, ProcessRequest, ProjectStatusResponse};
use crate::transport::{BatchTransport, ByteStream, ProgressTransport, StatusSnapshot};

/// Default base URL of the analysis API.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

const EVENT_STREAM: &str = "text/event-stream";

/// HTTP client for one analysis API server.
#[derive(Clone)]
pub struct AnalysisApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the analysis API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Analysis API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body stream broke off.
    #[error("Stream error: {0}")]
    Stream(String),
}

impl ApiError {
    /// Classification attached to a phase that fails because of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(e) if e.is_decode() => ErrorKind::Parse,
            Self::Request(_) | Self::Status { .. } | Self::Stream(_) => ErrorKind::Network,
        }
    }
}

impl AnalysisApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `POST /api/ai/process-stream`: submit a batch and receive its
    /// results as an event stream.
    pub async fn process_stream(&self, request: &ProcessRequest) -> Result<ByteStream, ApiError> {
        let response = self
            .client
            .post(format!("{}/api/ai/process-stream", self.api_url))
            .header(ACCEPT, EVENT_STREAM)
            .json(request)
            .send()
            .await?;

        Ok(Self::into_byte_stream(Self::ensure_success(response).await?))
    }

    /// `GET /projects/{id}/processing-progress`: long-lived progress stream.
    pub async fn progress_stream(&self, project_id: &str) -> Result<ByteStream, ApiError> {
        let response = self
            .client
            .get(format!(
                "{}/projects/{}/processing-progress",
                self.api_url, project_id
            ))
            .header(ACCEPT, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        Ok(Self::into_byte_stream(Self::ensure_success(response).await?))
    }

    /// `GET /projects/{id}/processing-status`
    pub async fn project_status(
        &self,
        project_id: &str,
    ) -> Result<ProjectStatusResponse, ApiError> {
        let response = self
            .client
            .get(format!(
                "{}/projects/{}/processing-status",
                self.api_url, project_id
            ))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /batches/{id}/status`
    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatusCounts, ApiError> {
        let response = self
            .client
            .get(format!("{}/batches/{}/status", self.api_url, batch_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    fn into_byte_stream(response: reqwest::Response) -> ByteStream {
        response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ApiError::Stream(e.to_string()))
            })
            .boxed()
    }
}

#[async_trait::async_trait]
impl BatchTransport for AnalysisApi {
    async fn open_batch_stream(&self, request: &ProcessRequest) -> Result<ByteStream, ApiError> {
        self.process_stream(request).await
    }
}

#[async_trait::async_trait]
impl ProgressTransport for AnalysisApi {
    async fn open_progress_stream(&self, subject: &str) -> Result<ByteStream, ApiError> {
        self.progress_stream(subject).await
    }

    async fn fetch_status(&self, subject: &str) -> Result<StatusSnapshot, ApiError> {
        Ok(self.project_status(subject).await?.into())
    }
}

/// Pull-only progress of one queued batch: `GET /batches/{id}/status`
/// reported as a single [`PHASE_BATCH`] phase. Batches have no event
/// stream, so the synchronizer only polls.
#[derive(Clone)]
pub struct BatchStatusPoller {
    api: AnalysisApi,
}

impl BatchStatusPoller {
    pub fn new(api: AnalysisApi) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl ProgressTransport for BatchStatusPoller {
    fn has_progress_stream(&self) -> bool {
        false
    }

    async fn open_progress_stream(&self, subject: &str) -> Result<ByteStream, ApiError> {
        Err(ApiError::Stream(format!("batch {subject} has no progress stream")))
    }

    async fn fetch_status(&self, subject: &str) -> Result<StatusSnapshot, ApiError> {
        let counts = self.api.batch_status(subject).await?;
        Ok(StatusSnapshot::default().with_phase(PHASE_BATCH, counts.into()))
    }
}
