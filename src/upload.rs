//! Resumable upload transport and asset readiness polling.
//!
//! Two-phase upload against the file service: a session-initiation request
//! that must echo a single-use session URL back in a response header, then
//! one byte transfer that uploads and finalizes in a single step, streaming
//! the file from disk rather than buffering it. Uploaded assets are
//! processed asynchronously server-side; [`FileStore::await_ready`] polls
//! the file resource until it reaches a terminal state.
//!
//! No retry happens inside this module. A session URL is single-use: a
//! failed transfer requires a fresh `begin_upload`.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::media::MediaAsset;

/// Response header carrying the session URL after session initiation.
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

/// A single-use upload session.
///
/// Consumed by value in [`FileStore::transfer_bytes`]; it cannot be reused
/// after a transfer, successful or not.
#[derive(Debug)]
pub struct UploadSession {
    pub upload_url: Url,
    pub total_bytes: u64,
    pub content_type: String,
}

/// Lifecycle state of an uploaded file resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FileState {
    Processing,
    Active,
    Failed,
    /// Any literal this client does not recognize.
    Other(String),
}

impl From<String> for FileState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PROCESSING" => FileState::Processing,
            "ACTIVE" => FileState::Active,
            "FAILED" => FileState::Failed,
            _ => FileState::Other(s),
        }
    }
}

fn default_file_state() -> FileState {
    FileState::Processing
}

/// Handle to an uploaded file resource.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    /// Server-assigned resource name, e.g. `files/abc123`.
    pub name: String,
    /// Dereferenceable URI used by the inference request.
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_file_state")]
    pub state: FileState,
}

#[derive(Debug, Deserialize)]
struct FileEnvelope {
    file: RemoteFile,
}

/// Client for the upload and file-status endpoints.
pub struct FileStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
    poll_interval: Duration,
    poll_timeout: Option<Duration>,
}

impl FileStore {
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
            request_timeout: config.request_timeout(),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        })
    }

    /// Phase 1: open an upload session for the asset.
    ///
    /// Declares total byte length and content type up front; the endpoint
    /// must echo a session URL in the `X-Goog-Upload-URL` response header.
    pub async fn begin_upload(&self, asset: &MediaAsset) -> Result<UploadSession> {
        let url = format!("{}/upload/v1beta/files", self.base_url);
        let body = serde_json::json!({"file": {"display_name": asset.display_name()}});

        debug!(size = asset.size_bytes(), mime = asset.mime_type(), "starting upload session");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header(
                "X-Goog-Upload-Header-Content-Length",
                asset.size_bytes().to_string(),
            )
            .header("X-Goog-Upload-Header-Content-Type", asset.mime_type())
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Transport(format!("upload session request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(PipelineError::Protocol {
                status: status.as_u16(),
                body,
            });
        }

        let raw_url = response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PipelineError::Protocol {
                status: status.as_u16(),
                body: format!("response is missing the {UPLOAD_URL_HEADER} header"),
            })?;
        let upload_url = Url::parse(raw_url).map_err(|e| PipelineError::Protocol {
            status: status.as_u16(),
            body: format!("invalid session URL {raw_url:?}: {e}"),
        })?;

        Ok(UploadSession {
            upload_url,
            total_bytes: asset.size_bytes(),
            content_type: asset.mime_type().to_string(),
        })
    }

    /// Phase 2: stream the asset's bytes to the session URL, uploading and
    /// finalizing in one request. Consumes the session.
    pub async fn transfer_bytes(
        &self,
        session: UploadSession,
        asset: &MediaAsset,
    ) -> Result<RemoteFile> {
        let file = tokio::fs::File::open(asset.path()).await.map_err(|e| {
            PipelineError::Transport(format!(
                "failed to open {}: {}",
                asset.path().display(),
                e
            ))
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        debug!(url = %session.upload_url, bytes = session.total_bytes, "transferring bytes");

        let response = self
            .client
            .put(session.upload_url.clone())
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Length", session.total_bytes.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(format!("byte transfer failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(PipelineError::Protocol {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: FileEnvelope = response.json().await.map_err(|e| PipelineError::Protocol {
            status: status.as_u16(),
            body: format!("unparseable transfer response: {e}"),
        })?;

        info!(name = %envelope.file.name, "upload finalized");
        Ok(envelope.file)
    }

    /// Poll the file resource until the server reports a terminal state.
    ///
    /// A transient status-check failure (transport error, non-success
    /// status, unparseable body) is treated as "still processing" rather
    /// than aborting the poll; only an explicit server verdict or the
    /// configured deadline ends it.
    pub async fn await_ready(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let url = format!("{}/v1beta/{}", self.base_url, name);
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let timeout = self.request_timeout;
        let check = move || {
            let client = client.clone();
            let api_key = api_key.clone();
            let url = url.clone();
            async move {
                let response = client
                    .get(&url)
                    .header("x-goog-api-key", &api_key)
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| PipelineError::Transport(format!("status check failed: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<unreadable>".to_string());
                    return Err(PipelineError::Transport(format!(
                        "status check returned {status}: {body}"
                    )));
                }
                response
                    .json::<RemoteFile>()
                    .await
                    .map_err(|e| PipelineError::Transport(format!("unparseable status body: {e}")))
            }
        };
        poll_until_active(check, self.poll_interval, self.poll_timeout, cancel, name).await
    }
}

/// Drive the readiness poll loop over an arbitrary status source.
///
/// Strictly sequential: one check, then one full interval, never
/// overlapping. Errors from `check` are non-terminal by design.
pub(crate) async fn poll_until_active<F, Fut>(
    mut check: F,
    interval: Duration,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    name: &str,
) -> Result<RemoteFile>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RemoteFile>>,
{
    let started = tokio::time::Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match check().await {
            Ok(file) => match &file.state {
                FileState::Active => {
                    info!(name, "remote asset is ready");
                    return Ok(file);
                }
                FileState::Failed => {
                    return Err(PipelineError::RemoteProcessing(format!(
                        "remote processing of {name} failed"
                    )));
                }
                FileState::Other(literal) => {
                    return Err(PipelineError::RemoteProcessing(format!(
                        "remote asset {name} reached unexpected state {literal:?}"
                    )));
                }
                FileState::Processing => {
                    debug!(name, "remote asset still processing");
                }
            },
            Err(e) => {
                warn!(name, error = %e, "status check failed; still waiting");
            }
        }

        if let Some(limit) = deadline {
            if started.elapsed() + interval > limit {
                return Err(PipelineError::RemoteProcessing(format!(
                    "gave up waiting for {name} after {}s",
                    limit.as_secs()
                )));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
