/// Embedding service client.
///
/// The embedding service is a remote collaborator: it turns a text question
/// into a fixed-length vector, one call per query. Ordinance chunks carry
/// embeddings precomputed at ingestion time, so at query time only the
/// question itself is embedded.
///
/// [`EmbeddingProvider`] is the seam the retriever depends on; the concrete
/// [`GeminiEmbedClient`] speaks the Gemini `embedContent` REST API.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned an empty embedding")]
    Empty,
}

impl EmbeddingError {
    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            EmbeddingError::Timeout(timeout)
        } else {
            EmbeddingError::Request(e)
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Request(e) => e.is_connect() || e.is_request(),
            EmbeddingError::Timeout(_) => true,
            EmbeddingError::Upstream { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            EmbeddingError::InvalidJson(_) | EmbeddingError::Empty => false,
        }
    }
}

/// Provider seam for query embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier reported in logs and metadata.
    fn model(&self) -> &str;

    /// Embed a single search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Clone, Debug)]
pub struct GeminiEmbedConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl GeminiEmbedConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `GEMINI_API_KEY`.
    /// Optional: `EMBEDDINGS_BASE_URL`, `EMBEDDINGS_MODEL`,
    /// `EMBEDDINGS_TIMEOUT_SECS`, `EMBEDDINGS_MAX_RETRIES`.
    pub fn from_env() -> Result<Self, String> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| "GEMINI_API_KEY environment variable is required".to_string())?;

        let base_url = std::env::var("EMBEDDINGS_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());

        let model = std::env::var("EMBEDDINGS_MODEL")
            .unwrap_or_else(|_| "text-embedding-004".to_string());

        let timeout = std::env::var("EMBEDDINGS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(15));

        let max_retries = std::env::var("EMBEDDINGS_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(2);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
            max_retries,
        })
    }
}

/// Client for the Gemini `embedContent` endpoint.
pub struct GeminiEmbedClient {
    config: GeminiEmbedConfig,
    http: reqwest::Client,
}

impl GeminiEmbedClient {
    pub fn new(config: GeminiEmbedConfig) -> Result<Self, EmbeddingError> {
        let http = reqwest::Client::builder()
            .user_agent("civix/embeddings")
            .build()
            .map_err(EmbeddingError::Request)?;
        Ok(Self { config, http })
    }

    async fn embed_once(&self, text: &str, task_type: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.config.base_url, self.config.model
        );
        let body = EmbedContentRequest {
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: task_type.to_string(),
        };

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::from_reqwest(e, self.config.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            return Err(EmbeddingError::Upstream { status, message });
        }

        let parsed: EmbedContentResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::from_reqwest(e, self.config.timeout))?;

        let values = parsed.embedding.values;
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        Ok(values)
    }

    /// One call per query, with an explicit bounded retry on transient
    /// failures. The retry bound comes from configuration, never implicitly.
    async fn embed_with_retry(
        &self,
        text: &str,
        task_type: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut attempt: u32 = 0;
        loop {
            match self.embed_once(text, task_type).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.config.max_retries || !e.is_retryable() {
                        return Err(e);
                    }
                    let delay = Duration::from_millis(200u64.saturating_mul(1 << attempt.min(5)));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "embedding request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        // RETRIEVAL_QUERY is the task type tuned for search queries; documents
        // are embedded with RETRIEVAL_DOCUMENT at ingestion time.
        self.embed_with_retry(text, "RETRIEVAL_QUERY").await
    }
}

#[derive(Debug, Serialize)]
struct EmbedContentRequest {
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: EmbedContentValues,
}

#[derive(Debug, Deserialize)]
struct EmbedContentValues {
    values: Vec<f32>,
}
