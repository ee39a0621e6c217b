//! Tolerant extraction of the structured report from model output.
//!
//! The model is not guaranteed to return pure JSON: it may prepend
//! commentary, append a sign-off, or wrap the document in a fenced code
//! block. Extraction is a prioritized chain of parse strategies tried in
//! order; the first one that yields a valid document wins. Only when every
//! strategy fails does extraction error, preserving the original text for
//! inspection.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{PipelineError, Result};
use crate::report::MatchAnalysis;

/// One strategy in the fallback chain, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// Parse the whole text as a document.
    Direct,
    /// Parse the interior of the first fenced code block.
    Fenced,
    /// Parse the substring from the first `{` to the last `}` inclusive.
    BraceSlice,
}

/// Strategies in the order they are attempted.
pub const STRATEGY_ORDER: [ParseStrategy; 3] = [
    ParseStrategy::Direct,
    ParseStrategy::Fenced,
    ParseStrategy::BraceSlice,
];

fn fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Optional "json" tag, lazy interior so only the first block matches.
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence pattern compiles"))
}

impl ParseStrategy {
    /// The substring this strategy would hand to the parser, if any.
    pub fn candidate<'a>(&self, raw: &'a str) -> Option<&'a str> {
        match self {
            ParseStrategy::Direct => Some(raw.trim()),
            ParseStrategy::Fenced => fence_pattern()
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim()),
            ParseStrategy::BraceSlice => {
                let start = raw.find('{')?;
                let end = raw.rfind('}')?;
                if end < start {
                    return None;
                }
                Some(&raw[start..=end])
            }
        }
    }
}

/// Extract a structured report from raw model output.
///
/// Pure and deterministic: the same input always resolves through the same
/// strategy to the same document.
pub fn extract_analysis(raw: &str) -> Result<MatchAnalysis> {
    for strategy in STRATEGY_ORDER {
        let Some(candidate) = strategy.candidate(raw) else {
            continue;
        };
        match serde_json::from_str::<MatchAnalysis>(candidate) {
            Ok(report) => {
                tracing::debug!(?strategy, "extracted analysis document");
                return Ok(report);
            }
            Err(e) => {
                tracing::trace!(?strategy, error = %e, "parse strategy failed");
            }
        }
    }
    Err(PipelineError::MalformedResponse {
        raw: raw.to_string(),
    })
}
