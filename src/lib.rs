//! pitchside: resilient match-footage ingestion and analysis.
//!
//! Takes one local media file, ships it to a generative-language endpoint
//! (inline base64 for small files; a resumable upload session plus
//! readiness polling for large ones), runs the model inference under a
//! transient-failure retry policy, and extracts a structured tactical
//! report from the model's free-form reply.

pub mod config;
pub mod error;
pub mod extract;
pub mod inference;
pub mod media;
pub mod pipeline;
pub mod report;
pub mod upload;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use media::{IngestStrategy, MediaAsset, MediaKind};
pub use pipeline::{Pipeline, RunStage, RunStatus};
pub use report::MatchAnalysis;
