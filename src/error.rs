//! Pipeline error taxonomy.
//!
//! Every failure an ingestion/analysis run can produce is classified here.
//! The orchestrator catches these at its boundary and publishes them as a
//! short classification plus a detail string; nothing escapes unclassified.

use thiserror::Error;

/// Errors produced by the ingestion and analysis pipeline.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// A size or type precondition failed. Never involves network I/O.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The upload session or byte-transfer endpoint returned non-success,
    /// or omitted the session URL. Not retried automatically; a retry must
    /// restart from session initiation.
    #[error("upload protocol error: {status} {body}")]
    Protocol { status: u16, body: String },

    /// The uploaded asset reached `FAILED` or a state the poller cannot
    /// reconcile, or readiness polling hit its deadline.
    #[error("remote processing failed: {0}")]
    RemoteProcessing(String),

    /// Transient inference failure: 429/503, a server-overload indicator in
    /// the body, or a network-transport failure. Retried up to the ceiling.
    #[error("transient inference failure: {0}")]
    InferenceTransient(String),

    /// The retry ceiling was reached without a successful attempt. Carries
    /// the last transient failure encountered.
    #[error("inference failed after {attempts} attempts: {last}")]
    InferenceExhausted { attempts: u32, last: String },

    /// Non-retryable model API failure (e.g. a 400 for a bad request).
    #[error("inference API error: {status} {body}")]
    Api { status: u16, body: String },

    /// No structured document could be extracted from the model response.
    /// The original text is preserved for user inspection.
    #[error("no structured analysis found in model response")]
    MalformedResponse { raw: String },

    /// Client-side request or file I/O failure outside the inference call.
    #[error("transport error: {0}")]
    Transport(String),

    /// A run is already active on this pipeline instance.
    #[error("an analysis run is already in progress")]
    Busy,

    /// The run's cancellation token was tripped.
    #[error("analysis run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short classification label for user-facing display.
    pub fn class(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Protocol { .. } => "upload-protocol",
            PipelineError::RemoteProcessing(_) => "remote-processing",
            PipelineError::InferenceTransient(_) => "inference-transient",
            PipelineError::InferenceExhausted { .. } => "inference-exhausted",
            PipelineError::Api { .. } => "inference-api",
            PipelineError::MalformedResponse { .. } => "malformed-response",
            PipelineError::Transport(_) => "transport",
            PipelineError::Busy => "busy",
            PipelineError::Cancelled => "cancelled",
        }
    }

    /// Whether the retry executor may re-issue the failed attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::InferenceTransient(_))
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Protocol {
            status: 500,
            body: "internal".to_string(),
        };
        assert_eq!(err.to_string(), "upload protocol error: 500 internal");

        let err = PipelineError::InferenceExhausted {
            attempts: 3,
            last: "503: overloaded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "inference failed after 3 attempts: 503: overloaded"
        );

        let err = PipelineError::Validation("file too large".to_string());
        assert_eq!(err.to_string(), "validation failed: file too large");
    }

    #[test]
    fn test_malformed_response_keeps_raw() {
        let err = PipelineError::MalformedResponse {
            raw: "I could not produce JSON".to_string(),
        };
        match err {
            PipelineError::MalformedResponse { raw } => {
                assert_eq!(raw, "I could not produce JSON");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(PipelineError::InferenceTransient("503".into()).is_transient());
        assert!(!PipelineError::Api {
            status: 400,
            body: "bad request".into()
        }
        .is_transient());
        assert!(!PipelineError::Validation("nope".into()).is_transient());
        assert!(!PipelineError::InferenceExhausted {
            attempts: 3,
            last: "x".into()
        }
        .is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(PipelineError::Busy.class(), "busy");
        assert_eq!(
            PipelineError::RemoteProcessing("state FAILED".into()).class(),
            "remote-processing"
        );
        assert_eq!(
            PipelineError::MalformedResponse { raw: String::new() }.class(),
            "malformed-response"
        );
    }
}
