//! Pipeline configuration.
//!
//! All tunables for one pipeline instance: endpoint and model, ingestion
//! size limits, readiness-poll cadence and deadline, and the inference
//! retry policy. Deserializable from config files with per-field defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default inference model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Default endpoint base URL.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Payloads at or below this embed directly in the request as base64.
pub const DEFAULT_INLINE_LIMIT_BYTES: u64 = 20 * 1024 * 1024;

/// Hard ceiling on accepted file size.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2000 * 1024 * 1024;

/// Configuration for an ingestion + analysis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// API key sent with every request.
    pub api_key: String,

    /// Endpoint base URL (override for proxies or testing).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier for the inference call.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum output tokens requested from the model.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Files strictly larger than this take the remote upload path.
    #[serde(default = "default_inline_limit_bytes")]
    pub inline_limit_bytes: u64,

    /// Files larger than this are rejected before any network I/O.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Interval between readiness status checks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Overall readiness-poll deadline in milliseconds. Zero disables it.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Total inference attempts (1 initial + retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit: the delay before retry `k` is `2^k` times this.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Timeout for session-initiation, status, and inference requests, in
    /// seconds. The byte transfer itself is not bounded by this.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_inline_limit_bytes() -> u64 {
    DEFAULT_INLINE_LIMIT_BYTES
}

fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_timeout_ms() -> u64 {
    600_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl PipelineConfig {
    /// Create a config with defaults for everything but the API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: default_base_url(),
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            inline_limit_bytes: default_inline_limit_bytes(),
            max_file_bytes: default_max_file_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Set a custom base URL (e.g., for proxy or testing).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set a custom model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the readiness-poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the backoff unit for inference retries.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    /// Readiness-poll cadence as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Readiness-poll deadline, `None` when disabled.
    pub fn poll_timeout(&self) -> Option<Duration> {
        if self.poll_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.poll_timeout_ms))
        }
    }

    /// Backoff unit as a `Duration`.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Per-request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(PipelineError::Validation(
                "API key must not be empty".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.inline_limit_bytes > self.max_file_bytes {
            return Err(PipelineError::Validation(format!(
                "inline limit ({}) exceeds file ceiling ({})",
                self.inline_limit_bytes, self.max_file_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new("test-key");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.inline_limit_bytes, 20 * 1024 * 1024);
        assert_eq!(config.max_file_bytes, 2000 * 1024 * 1024);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"api_key": "k"}"#).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.poll_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_with_base_url_trims_trailing_slash() {
        let config = PipelineConfig::new("k").with_base_url("http://localhost:9999/");
        assert_eq!(config.base_url, "http://localhost:9999");
    }

    #[test]
    fn test_zero_poll_timeout_disables_deadline() {
        let mut config = PipelineConfig::new("k");
        config.poll_timeout_ms = 0;
        assert_eq!(config.poll_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        assert!(PipelineConfig::new("").validate().is_err());
        assert!(PipelineConfig::new("   ").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = PipelineConfig::new("k");
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = PipelineConfig::new("k");
        config.inline_limit_bytes = 100;
        config.max_file_bytes = 50;
        assert!(config.validate().is_err());
    }
}
