//! Media asset model and ingestion strategy selection.
//!
//! A `MediaAsset` is the one input a run accepts: a local file with a byte
//! length and a declared MIME type. It is immutable once built; selecting a
//! new file means building a new asset, never mutating one in place.
//! Strategy selection decides from size alone whether the payload is
//! embedded inline in the inference request or routed through the upload
//! service.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Broad media category derived from a MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    /// Determine media kind from a MIME type string.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let lower = mime.to_lowercase();
        if lower.starts_with("video/") {
            Some(MediaKind::Video)
        } else if lower.starts_with("audio/") {
            Some(MediaKind::Audio)
        } else if lower.starts_with("image/") {
            Some(MediaKind::Image)
        } else {
            None
        }
    }
}

/// How a payload reaches the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStrategy {
    /// Base64-encode the full content into the inference request.
    Inline,
    /// Two-phase resumable upload, then reference the remote file by URI.
    Remote,
}

impl IngestStrategy {
    /// Select a strategy from a byte size. Strictly greater than the inline
    /// limit routes remote; small payloads skip the upload round-trip.
    pub fn for_size(size_bytes: u64, inline_limit_bytes: u64) -> Self {
        if size_bytes > inline_limit_bytes {
            IngestStrategy::Remote
        } else {
            IngestStrategy::Inline
        }
    }
}

/// A locally selected media file.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    path: PathBuf,
    size_bytes: u64,
    mime_type: String,
}

impl MediaAsset {
    /// Build an asset from an on-disk file, reading its length from
    /// filesystem metadata. The MIME type is inferred from the extension
    /// when not supplied.
    pub async fn from_path(path: impl Into<PathBuf>, mime_type: Option<&str>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            PipelineError::Transport(format!("failed to stat {}: {}", path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(PipelineError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let mime = match mime_type {
            Some(m) => m.to_string(),
            None => mime_from_extension(&path)
                .ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "cannot infer a media type for {}; pass one explicitly",
                        path.display()
                    ))
                })?
                .to_string(),
        };
        Ok(Self::new(path, meta.len(), mime))
    }

    /// Build an asset from already-known parts.
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Media kind, if the MIME type is one the pipeline understands.
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime_type)
    }

    /// Display name sent with the upload session request.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    }

    /// Enforce preconditions before any network I/O happens.
    pub fn validate(&self, config: &PipelineConfig) -> Result<()> {
        if self.size_bytes == 0 {
            return Err(PipelineError::Validation(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        if self.size_bytes > config.max_file_bytes {
            return Err(PipelineError::Validation(format!(
                "{} is {} bytes, above the {} byte ceiling",
                self.path.display(),
                self.size_bytes,
                config.max_file_bytes
            )));
        }
        if self.kind().is_none() {
            return Err(PipelineError::Validation(format!(
                "unsupported media type: {}",
                self.mime_type
            )));
        }
        Ok(())
    }

    /// Ingestion strategy for this asset under the given configuration.
    pub fn strategy(&self, config: &PipelineConfig) -> IngestStrategy {
        IngestStrategy::for_size(self.size_bytes, config.inline_limit_bytes)
    }
}

/// Map common media file extensions to a MIME type.
fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "m4a" => Some("audio/mp4"),
        "ogg" => Some("audio/ogg"),
        "flac" => Some("audio/flac"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
