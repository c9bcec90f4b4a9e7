/// Completion service clients.
///
/// The answer synthesizer talks to a large-language-model provider through
/// the [`CompletionProvider`] trait so providers stay interchangeable:
/// [`AnthropicClient`] speaks the Anthropic messages API and
/// [`OpenAiCompatClient`] speaks any OpenAI-compatible chat endpoint
/// (including local hosts). [`create_provider`] picks one from configuration.
///
/// Failures are typed (timeout, upstream status, malformed body) so the
/// caller can choose user-facing behavior. Retries are explicit and bounded.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("upstream returned non-JSON error: status={status} body={body}")]
    UpstreamBody { status: StatusCode, body: String },

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("completion response contained no text")]
    EmptyResponse,
}

impl CompletionError {
    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            CompletionError::Timeout(timeout)
        } else {
            CompletionError::Request(e)
        }
    }
}

fn should_retry(err: &CompletionError) -> bool {
    match err {
        CompletionError::Request(e) => e.is_connect() || e.is_request(),
        CompletionError::Timeout(_) => true,
        CompletionError::Upstream { status, .. } | CompletionError::UpstreamBody { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        CompletionError::InvalidJson(_) | CompletionError::EmptyResponse => false,
    }
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    Duration::from_millis(capped_ms.saturating_add(pseudo_jitter_ms(jitter_cap)))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    (now.subsec_nanos() as u64) % (max_inclusive + 1)
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

/// A single synthesis request: one system instruction, one user prompt.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Synthesized text plus the token count the provider reported (0 if it
/// reported none).
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider name surfaced in response metadata ("anthropic",
    /// "openai").
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

#[derive(Clone, Debug)]
pub struct CompletionConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl CompletionConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `COMPLETION_API_KEY` (unless the endpoint is a local host
    /// that ignores it, in which case any placeholder works).
    /// Optional: `COMPLETION_PROVIDER` ("anthropic" default, or "openai"),
    /// `COMPLETION_BASE_URL`, `COMPLETION_MODEL`, `COMPLETION_TIMEOUT_SECS`,
    /// `COMPLETION_MAX_RETRIES`, `COMPLETION_RETRY_INITIAL_MS`,
    /// `COMPLETION_RETRY_MAX_MS`, `COMPLETION_MAX_ERROR_BODY_BYTES`.
    pub fn from_env() -> Result<Self, String> {
        let provider =
            std::env::var("COMPLETION_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());

        let api_key = std::env::var("COMPLETION_API_KEY")
            .map_err(|_| "COMPLETION_API_KEY environment variable is required".to_string())?;

        let base_url = std::env::var("COMPLETION_BASE_URL").unwrap_or_else(|_| {
            match provider.as_str() {
                "openai" => "https://api.openai.com/v1".to_string(),
                _ => "https://api.anthropic.com".to_string(),
            }
        });

        let model = std::env::var("COMPLETION_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        let timeout = std::env::var("COMPLETION_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(30));

        let max_retries = std::env::var("COMPLETION_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(2);

        let initial_backoff = std::env::var("COMPLETION_RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(200));

        let max_backoff = std::env::var("COMPLETION_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(5_000));

        let max_error_body_bytes = std::env::var("COMPLETION_MAX_ERROR_BODY_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8 * 1024);

        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
            max_retries,
            initial_backoff,
            max_backoff,
            max_error_body_bytes,
        })
    }
}

/// Instantiate the configured provider.
pub fn create_provider(
    config: CompletionConfig,
) -> Result<std::sync::Arc<dyn CompletionProvider>, CompletionError> {
    match config.provider.as_str() {
        "openai" => Ok(std::sync::Arc::new(OpenAiCompatClient::new(config)?)),
        _ => Ok(std::sync::Arc::new(AnthropicClient::new(config)?)),
    }
}

async fn request_with_retry<T, Fut, F>(config: &CompletionConfig, mut f: F) -> Result<T, CompletionError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CompletionError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt > config.max_retries || !should_retry(&e) {
                    return Err(e);
                }
                let delay = backoff_delay(config.initial_backoff, config.max_backoff, attempt - 1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "completion request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// --- Anthropic messages API ---

pub struct AnthropicClient {
    config: CompletionConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .user_agent("civix/completion")
            .build()
            .map_err(CompletionError::Request)?;
        Ok(Self { config, http })
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let body = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
        };

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, self.config.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = read_limited_text(resp, self.config.max_error_body_bytes).await;
            if let Ok(parsed) = serde_json::from_str::<AnthropicErrorEnvelope>(&body) {
                return Err(CompletionError::Upstream {
                    status,
                    message: parsed.error.message,
                });
            }
            return Err(CompletionError::UpstreamBody { status, body });
        }

        let parsed: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, self.config.timeout))?;

        let text = parsed
            .content
            .iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text.clone())
            .ok_or(CompletionError::EmptyResponse)?;

        let tokens_used = parsed
            .usage
            .as_ref()
            .and_then(|u| u.output_tokens)
            .unwrap_or(0);

        Ok(Completion { text, tokens_used })
    }
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        request_with_retry(&self.config, || self.send(&request)).await
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[allow(dead_code)]
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorObject,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorObject {
    message: String,
}

// --- OpenAI-compatible chat completions ---

pub struct OpenAiCompatClient {
    config: CompletionConfig,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .user_agent("civix/completion")
            .build()
            .map_err(CompletionError::Request)?;
        Ok(Self { config, http })
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, self.config.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = read_limited_text(resp, self.config.max_error_body_bytes).await;
            if let Ok(parsed) = serde_json::from_str::<OpenAiErrorEnvelope>(&body) {
                let message = parsed
                    .error
                    .message
                    .unwrap_or_else(|| "unknown upstream error".to_string());
                return Err(CompletionError::Upstream { status, message });
            }
            return Err(CompletionError::UpstreamBody { status, body });
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, self.config.timeout))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|t| !t.is_empty())
            .ok_or(CompletionError::EmptyResponse)?;

        let tokens_used = parsed
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .unwrap_or(0);

        Ok(Completion { text, tokens_used })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        request_with_retry(&self.config, || self.send(&request)).await
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[allow(dead_code)]
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorObject,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorObject {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anthropic_response() {
        let raw = r#"{
            "content": [{"type": "text", "text": "Fences may be up to 6 feet."}],
            "usage": {"input_tokens": 812, "output_tokens": 95}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        let text = parsed
            .content
            .iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text.clone())
            .unwrap();
        assert_eq!(text, "Fences may be up to 6 feet.");
        assert_eq!(parsed.usage.unwrap().output_tokens, Some(95));
    }

    #[test]
    fn parses_anthropic_error_envelope() {
        let raw = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let parsed: AnthropicErrorEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.error.message, "Overloaded");
    }

    #[test]
    fn parses_openai_compatible_response() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "See §701-3."}}],
            "usage": {"prompt_tokens": 640, "completion_tokens": 41, "total_tokens": 681}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("See §701-3.")
        );
        assert_eq!(parsed.usage.unwrap().completion_tokens, Some(41));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        let rate_limited = CompletionError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "quota".to_string(),
        };
        let bad_request = CompletionError::Upstream {
            status: StatusCode::BAD_REQUEST,
            message: "bad".to_string(),
        };
        assert!(should_retry(&rate_limited));
        assert!(!should_retry(&bad_request));
        assert!(!should_retry(&CompletionError::EmptyResponse));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        let first = backoff_delay(initial, max, 0);
        let fourth = backoff_delay(initial, max, 4);
        assert!(first >= Duration::from_millis(100));
        // Cap plus at most 25% jitter.
        assert!(fourth <= Duration::from_millis(1_250));
    }
}
