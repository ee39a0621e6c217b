//! Model inference call and transient-failure retry policy.
//!
//! One inference attempt is a single `generateContent` POST carrying the
//! media payload (inline base64 or a remote file reference) plus the
//! caller's instruction. [`invoke_with_retry`] wraps an attempt source with
//! the pipeline's retry policy: transient failures (server overload,
//! rate limiting, network transport) back off exponentially and retry up
//! to a fixed ceiling; anything else aborts immediately.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Body substrings that mark a failure as server overload.
const OVERLOAD_MARKERS: [&str; 3] = ["overloaded", "unavailable", "resource_exhausted"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A `generateContent` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

/// One content part. Serialized as a single-key object per variant, the
/// shape the endpoint expects.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    File {
        #[serde(rename = "fileData")]
        file_data: FileRef,
    },
}

/// Base64-embedded media payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Reference to an uploaded file resource.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
}

impl GenerateRequest {
    /// Request carrying the payload embedded as base64.
    pub fn with_inline(
        mime_type: &str,
        data_base64: String,
        instruction: &str,
        max_output_tokens: u32,
    ) -> Self {
        Self::from_media_part(
            Part::Inline {
                inline_data: Blob {
                    mime_type: mime_type.to_string(),
                    data: data_base64,
                },
            },
            instruction,
            max_output_tokens,
        )
    }

    /// Request referencing an uploaded file by URI.
    pub fn with_file(
        mime_type: &str,
        file_uri: &str,
        instruction: &str,
        max_output_tokens: u32,
    ) -> Self {
        Self::from_media_part(
            Part::File {
                file_data: FileRef {
                    mime_type: mime_type.to_string(),
                    file_uri: file_uri.to_string(),
                },
            },
            instruction,
            max_output_tokens,
        )
    }

    fn from_media_part(media: Part, instruction: &str, max_output_tokens: u32) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![
                    media,
                    Part::Text {
                        text: instruction.to_string(),
                    },
                ],
            }],
            generation_config: Some(GenerationConfig { max_output_tokens }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Single-attempt client
// ---------------------------------------------------------------------------

/// One inference attempt against a model endpoint. Implementations do not
/// retry; retry is the executor's concern.
#[async_trait]
pub trait GenerateBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// HTTP client for the `generateContent` endpoint.
pub struct ModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

impl ModelClient {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                PipelineError::Transport(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            request_timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl GenerateBackend for ModelClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(request)
            .timeout(self.request_timeout)
            .send()
            .await
            // A transport-level send failure is retryable by policy.
            .map_err(|e| {
                PipelineError::InferenceTransient(format!("request transport failure: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(classify_failure(status.as_u16(), body));
        }

        let parsed: GenerateResponse =
            response.json().await.map_err(|e| PipelineError::Api {
                status: status.as_u16(),
                body: format!("unparseable response: {e}"),
            })?;
        response_text(parsed, status.as_u16())
    }
}

/// Map a non-success inference status + body to its error class.
pub(crate) fn classify_failure(status: u16, body: String) -> PipelineError {
    if status == 429 || status == 503 {
        return PipelineError::InferenceTransient(format!("{status}: {body}"));
    }
    let lower = body.to_lowercase();
    if OVERLOAD_MARKERS.iter().any(|m| lower.contains(m)) {
        return PipelineError::InferenceTransient(format!("{status}: {body}"));
    }
    PipelineError::Api { status, body }
}

/// Concatenate the text parts of the first candidate.
fn response_text(response: GenerateResponse, status: u16) -> Result<String> {
    let text: String = response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        return Err(PipelineError::Api {
            status,
            body: "model response contained no text content".to_string(),
        });
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// Retry executor
// ---------------------------------------------------------------------------

/// Retry policy for the inference call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, counting the initial one.
    pub max_attempts: u32,
    /// Backoff unit; the delay before retry `k` is `2^k` times this.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
        }
    }

    /// Delay awaited before 1-based retry attempt `retry`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(retry)
    }
}

/// Run `attempt` under the retry policy.
///
/// Only transient failures are retried; any other failure is re-raised
/// immediately. `on_retry` fires with the 1-based retry ordinal before each
/// backoff sleep so the caller can surface "retrying (n)" state. When all
/// attempts fail, the last transient failure is folded into
/// [`PipelineError::InferenceExhausted`].
pub async fn invoke_with_retry<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32),
    mut attempt: F,
) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut last: Option<PipelineError> = None;

    for n in 0..policy.max_attempts {
        if n > 0 {
            on_retry(n);
            let delay = policy.backoff_delay(n);
            let delay_ms = delay.as_millis() as u64;
            debug!(retry = n, delay_ms, "backing off before retry");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = attempt() => result,
        };

        match outcome {
            Ok(text) => {
                if n > 0 {
                    info!(attempts = n + 1, "inference succeeded after retry");
                }
                return Ok(text);
            }
            Err(e) if e.is_transient() => {
                warn!(attempt = n + 1, error = %e, "transient inference failure");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    let last = last
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts were made".to_string());
    Err(PipelineError::InferenceExhausted {
        attempts: policy.max_attempts,
        last,
    })
}
