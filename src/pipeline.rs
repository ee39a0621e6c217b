//! Pipeline orchestration: one full ingestion + analysis run.
//!
//! The orchestrator sequences validation, strategy selection, the upload
//! path, the retried inference call, and response extraction, publishing a
//! [`RunStatus`] snapshot over a watch channel after every transition. It
//! is the only writer of run state; collaborators observe through
//! [`Pipeline::subscribe`].
//!
//! Single-flight: one run at a time per pipeline instance. A second `run`
//! while one is active fails fast with [`PipelineError::Busy`]. There is
//! no mid-run resume; the only recovery from a failure is a fresh run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extract::extract_analysis;
use crate::inference::{
    invoke_with_retry, GenerateBackend, GenerateRequest, ModelClient, RetryPolicy,
};
use crate::media::{IngestStrategy, MediaAsset};
use crate::report::MatchAnalysis;
use crate::upload::FileStore;

/// Progress ceiling while a run is still in flight; only a terminal
/// transition may pass it.
const PROGRESS_CAP: u8 = 89;

/// Cadence of the cosmetic progress ticker.
const TICK_INTERVAL: Duration = Duration::from_millis(400);

/// Stage of the currently observed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Preparing,
    Uploading,
    ProcessingRemote,
    Analyzing,
    /// Backing off before the given 1-based retry attempt.
    Retrying(u32),
    Succeeded,
    Failed,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Succeeded | RunStage::Failed)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::Idle => f.write_str("idle"),
            RunStage::Preparing => f.write_str("preparing"),
            RunStage::Uploading => f.write_str("uploading"),
            RunStage::ProcessingRemote => f.write_str("processing remotely"),
            RunStage::Analyzing => f.write_str("analyzing"),
            RunStage::Retrying(n) => write!(f, "retrying ({n})"),
            RunStage::Succeeded => f.write_str("succeeded"),
            RunStage::Failed => f.write_str("failed"),
        }
    }
}

/// Classified failure retained for display.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub class: &'static str,
    pub detail: String,
}

/// Snapshot of run state published to observers.
///
/// Progress is a cosmetic, monotonically-increasing approximation while
/// the run is in flight; it carries no protocol meaning.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub stage: RunStage,
    pub progress: u8,
    pub retry_count: u32,
    pub failure: Option<RunFailure>,
    /// Raw model output, kept for inspection once an attempt succeeds.
    pub raw_response: Option<String>,
    /// Final report. Only ever written in the `Succeeded` transition;
    /// cleared when the next run resets.
    pub report: Option<MatchAnalysis>,
}

impl RunStatus {
    fn idle() -> Self {
        Self {
            stage: RunStage::Idle,
            progress: 0,
            retry_count: 0,
            failure: None,
            raw_response: None,
            report: None,
        }
    }
}

/// Aborts the cosmetic progress task when the run leaves its scope.
struct ProgressTicker {
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressTicker {
    fn spawn(status: Arc<watch::Sender<RunStatus>>) -> Self {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                status.send_modify(|s| {
                    if !s.stage.is_terminal() && s.progress < PROGRESS_CAP {
                        let step = ((PROGRESS_CAP - s.progress) / 8).max(1);
                        s.progress = (s.progress + step).min(PROGRESS_CAP);
                    }
                });
            }
        });
        Self { handle }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Orchestrates ingestion and analysis runs.
pub struct Pipeline {
    config: PipelineConfig,
    files: FileStore,
    model: Arc<dyn GenerateBackend>,
    status: Arc<watch::Sender<RunStatus>>,
    run_lock: tokio::sync::Mutex<()>,
    current_cancel: std::sync::Mutex<CancellationToken>,
}

impl Pipeline {
    /// Build a pipeline backed by the HTTP model client.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let model = Arc::new(ModelClient::new(&config)?);
        Self::with_backend(config, model)
    }

    /// Build a pipeline with a custom inference backend.
    pub fn with_backend(config: PipelineConfig, model: Arc<dyn GenerateBackend>) -> Result<Self> {
        config.validate()?;
        let files = FileStore::new(&config)?;
        let (status, _) = watch::channel(RunStatus::idle());
        Ok(Self {
            config,
            files,
            model,
            status: Arc::new(status),
            run_lock: tokio::sync::Mutex::new(()),
            current_cancel: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    /// Observe run state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Current run state snapshot.
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Trip the active run's cancellation token. A cancelled run surfaces
    /// [`PipelineError::Cancelled`] and transitions to `Failed`.
    pub fn cancel(&self) {
        let guard = self
            .current_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.cancel();
    }

    /// Drive one full run: validate, ingest, analyze, extract.
    ///
    /// Exactly one run may be active at a time; concurrent calls fail with
    /// [`PipelineError::Busy`] without touching the active run's state.
    pub async fn run(&self, asset: &MediaAsset, instruction: &str) -> Result<MatchAnalysis> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;

        let cancel = CancellationToken::new();
        {
            let mut slot = self
                .current_cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = cancel.clone();
        }

        let outcome = self.execute(asset, instruction, &cancel).await;
        match &outcome {
            Ok(_) => info!("analysis run succeeded"),
            Err(e) => {
                warn!(class = e.class(), error = %e, "analysis run failed");
                self.status.send_modify(|s| {
                    s.stage = RunStage::Failed;
                    s.failure = Some(RunFailure {
                        class: e.class(),
                        detail: e.to_string(),
                    });
                });
            }
        }
        outcome
    }

    async fn execute(
        &self,
        asset: &MediaAsset,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> Result<MatchAnalysis> {
        // Preparing: reset all run-scoped state before anything else.
        self.status.send_replace(RunStatus {
            stage: RunStage::Preparing,
            ..RunStatus::idle()
        });

        asset.validate(&self.config)?;
        self.enter_stage(RunStage::Preparing, 5);

        // Torn down when this scope ends, terminal or not.
        let _ticker = ProgressTicker::spawn(self.status.clone());

        let request = match asset.strategy(&self.config) {
            IngestStrategy::Remote => {
                debug!(size = asset.size_bytes(), "large asset, taking the upload path");
                self.enter_stage(RunStage::Uploading, 15);
                let session = guarded(cancel, self.files.begin_upload(asset)).await?;
                let file = guarded(cancel, self.files.transfer_bytes(session, asset)).await?;

                self.enter_stage(RunStage::ProcessingRemote, 55);
                let ready = self.files.await_ready(&file.name, cancel).await?;
                GenerateRequest::with_file(
                    asset.mime_type(),
                    &ready.uri,
                    instruction,
                    self.config.max_output_tokens,
                )
            }
            IngestStrategy::Inline => {
                debug!(size = asset.size_bytes(), "small asset, embedding inline");
                let bytes = guarded(cancel, async {
                    tokio::fs::read(asset.path()).await.map_err(|e| {
                        PipelineError::Transport(format!(
                            "failed to read {}: {}",
                            asset.path().display(),
                            e
                        ))
                    })
                })
                .await?;
                let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                GenerateRequest::with_inline(
                    asset.mime_type(),
                    data,
                    instruction,
                    self.config.max_output_tokens,
                )
            }
        };

        self.enter_stage(RunStage::Analyzing, 70);

        let policy = RetryPolicy::from_config(&self.config);
        let model = Arc::clone(&self.model);
        let request = Arc::new(request);
        let raw = invoke_with_retry(
            policy,
            cancel,
            |n| self.note_retry(n),
            move || {
                let model = Arc::clone(&model);
                let request = Arc::clone(&request);
                async move { model.generate(&request).await }
            },
        )
        .await?;

        // Keep the raw text around even if extraction fails below.
        self.status
            .send_modify(|s| s.raw_response = Some(raw.clone()));

        let mut report = extract_analysis(&raw)?;
        report.generated_at = Some(Utc::now());

        self.status.send_modify(|s| {
            s.stage = RunStage::Succeeded;
            s.progress = 100;
            s.report = Some(report.clone());
        });
        Ok(report)
    }

    /// Transition stage and raise the progress floor; progress never moves
    /// backwards within a run.
    fn enter_stage(&self, stage: RunStage, floor: u8) {
        debug!(%stage, "entering stage");
        self.status.send_modify(|s| {
            s.stage = stage;
            if floor > s.progress {
                s.progress = floor;
            }
        });
    }

    fn note_retry(&self, retry: u32) {
        self.status.send_modify(|s| {
            s.stage = RunStage::Retrying(retry);
            s.retry_count = retry;
        });
    }
}

/// Race a pipeline step against run cancellation. Dropping the in-flight
/// future aborts any underlying request.
async fn guarded<T>(
    cancel: &CancellationToken,
    step: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = step => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn clean_document() -> String {
        serde_json::json!({
            "matchContext": {"homeTeam": "Riverton FC", "awayTeam": "Harbour United"},
            "events": [
                {"timestamp": "02:10", "type": "kickoff", "description": "First half begins."}
            ]
        })
        .to_string()
    }

    /// Backend that pops scripted outcomes, optionally gated on a notify.
    struct MockBackend {
        outcomes: Mutex<VecDeque<Result<String>>>,
        requests: Mutex<Vec<GenerateRequest>>,
        calls: AtomicU32,
        gate: Option<Arc<Notify>>,
        hang: bool,
    }

    impl MockBackend {
        fn scripted(outcomes: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                gate: None,
                hang: false,
            })
        }

        fn gated(outcomes: Vec<Result<String>>, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                gate: Some(gate),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                gate: None,
                hang: true,
            })
        }
    }

    #[async_trait]
    impl GenerateBackend for MockBackend {
        async fn generate(&self, request: &GenerateRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(clean_document()))
        }
    }

    fn test_config(dir: &std::path::Path) -> (PipelineConfig, MediaAsset) {
        let path = dir.join("clip.mp4");
        std::fs::write(&path, b"tiny recording bytes").unwrap();
        let config = PipelineConfig::new("test-key").with_base_url("http://127.0.0.1:9");
        let asset = MediaAsset::new(path, 20, "video/mp4");
        (config, asset)
    }

    #[tokio::test]
    async fn test_inline_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let backend = MockBackend::scripted(vec![Ok(clean_document())]);
        let pipeline = Pipeline::with_backend(config, backend.clone()).unwrap();

        let report = pipeline.run(&asset, "analyze this match").await.unwrap();

        assert_eq!(report.match_context.home_team, "Riverton FC");
        assert!(report.generated_at.is_some());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let status = pipeline.status();
        assert_eq!(status.stage, RunStage::Succeeded);
        assert_eq!(status.progress, 100);
        assert_eq!(status.retry_count, 0);
        assert!(status.failure.is_none());
        assert!(status.raw_response.is_some());
        assert_eq!(
            status.report.as_ref().unwrap().match_context.home_team,
            "Riverton FC"
        );

        // The request embedded the payload inline with the instruction.
        let requests = backend.requests.lock().unwrap();
        let json = serde_json::to_value(&requests[0]).unwrap();
        assert_eq!(
            json["contents"][0]["parts"][0]["inlineData"]["mimeType"],
            "video/mp4"
        );
        assert_eq!(
            json["contents"][0]["parts"][1]["text"],
            "analyze this match"
        );
    }

    #[tokio::test]
    async fn test_oversize_fails_validation_without_inference() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, _) = test_config(dir.path());
        config.max_file_bytes = 10;
        let backend = MockBackend::scripted(vec![]);
        let pipeline = Pipeline::with_backend(config, backend.clone()).unwrap();

        let asset = MediaAsset::new(dir.path().join("clip.mp4"), 11, "video/mp4");
        let err = pipeline.run(&asset, "analyze").await.unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)), "{err:?}");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let status = pipeline.status();
        assert_eq!(status.stage, RunStage::Failed);
        assert_eq!(status.failure.as_ref().unwrap().class, "validation");
    }

    #[tokio::test]
    async fn test_malformed_response_keeps_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let backend =
            MockBackend::scripted(vec![Ok("I cannot analyze this recording.".to_string())]);
        let pipeline = Pipeline::with_backend(config, backend).unwrap();

        let err = pipeline.run(&asset, "analyze").await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse { .. }), "{err:?}");

        let status = pipeline.status();
        assert_eq!(status.stage, RunStage::Failed);
        assert_eq!(status.failure.as_ref().unwrap().class, "malformed-response");
        assert_eq!(
            status.raw_response.as_deref(),
            Some("I cannot analyze this recording.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_visible_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let backend = MockBackend::scripted(vec![
            Err(PipelineError::InferenceTransient("503: overloaded".into())),
            Err(PipelineError::InferenceTransient("503: overloaded".into())),
            Ok(clean_document()),
        ]);
        let pipeline = Arc::new(Pipeline::with_backend(config, backend.clone()).unwrap());

        // Collect every observed stage transition.
        let mut rx = pipeline.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let collector = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let status = rx.borrow_and_update().clone();
                let terminal = status.stage.is_terminal();
                sink.lock().unwrap().push(status.stage);
                if terminal {
                    break;
                }
            }
        });

        let report = pipeline.run(&asset, "analyze").await.unwrap();
        assert_eq!(report.events.len(), 1);
        let _ = collector.await;

        let stages = seen.lock().unwrap();
        assert!(stages.contains(&RunStage::Retrying(1)), "{stages:?}");
        assert!(stages.contains(&RunStage::Retrying(2)), "{stages:?}");
        assert_eq!(*stages.last().unwrap(), RunStage::Succeeded);

        let status = pipeline.status();
        assert_eq!(status.retry_count, 2);
        assert_eq!(status.progress, 100);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_classified() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, asset) = test_config(dir.path());
        config.backoff_base_ms = 1;
        let backend = MockBackend::scripted(vec![
            Err(PipelineError::InferenceTransient("429: slow down".into())),
            Err(PipelineError::InferenceTransient("429: slow down".into())),
            Err(PipelineError::InferenceTransient("429: slow down".into())),
        ]);
        let pipeline = Pipeline::with_backend(config, backend.clone()).unwrap();

        let err = pipeline.run(&asset, "analyze").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InferenceExhausted { attempts: 3, .. }
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            pipeline.status().failure.as_ref().unwrap().class,
            "inference-exhausted"
        );
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let gate = Arc::new(Notify::new());
        let backend = MockBackend::gated(vec![Ok(clean_document())], gate.clone());
        let pipeline = Arc::new(Pipeline::with_backend(config, backend).unwrap());

        let first = {
            let pipeline = pipeline.clone();
            let asset = asset.clone();
            tokio::spawn(async move { pipeline.run(&asset, "analyze").await })
        };

        // Let the first run reach the gated inference call.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pipeline.run(&asset, "analyze").await.unwrap_err();
        assert!(matches!(err, PipelineError::Busy));

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.match_context.home_team, "Riverton FC");
        // The rejected call did not disturb the active run's state.
        assert_eq!(pipeline.status().stage, RunStage::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_run() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let backend = MockBackend::hanging();
        let pipeline = Arc::new(Pipeline::with_backend(config, backend).unwrap());

        let handle = {
            let pipeline = pipeline.clone();
            let asset = asset.clone();
            tokio::spawn(async move { pipeline.run(&asset, "analyze").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(pipeline.status().stage, RunStage::Failed);
        assert_eq!(pipeline.status().failure.as_ref().unwrap().class, "cancelled");
    }

    #[tokio::test]
    async fn test_rerun_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let (config, asset) = test_config(dir.path());
        let backend = MockBackend::scripted(vec![
            Ok("no structured output".to_string()),
            Ok(clean_document()),
        ]);
        let pipeline = Pipeline::with_backend(config, backend).unwrap();

        assert!(pipeline.run(&asset, "analyze").await.is_err());
        assert_eq!(pipeline.status().stage, RunStage::Failed);
        assert!(pipeline.status().report.is_none(), "no report on failure");

        let report = pipeline.run(&asset, "analyze").await.unwrap();
        assert_eq!(report.match_context.home_team, "Riverton FC");
        let status = pipeline.status();
        assert_eq!(status.stage, RunStage::Succeeded);
        assert!(status.failure.is_none(), "failure cleared on re-run");
        assert_eq!(status.retry_count, 0);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(RunStage::Retrying(2).to_string(), "retrying (2)");
        assert_eq!(RunStage::ProcessingRemote.to_string(), "processing remotely");
        assert!(RunStage::Succeeded.is_terminal());
        assert!(RunStage::Failed.is_terminal());
        assert!(!RunStage::Analyzing.is_terminal());
    }
}
