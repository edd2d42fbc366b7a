//! AnalysisService - Session Control Surface
//!
//! ## Responsibilities
//!
//! - Start an analysis session (validate address, spawn the pipeline task)
//! - Stop a session (cancel, then wait for pipeline cleanup)
//! - Session listing and lookup
//! - Shutdown of every running pipeline
//!
//! One tokio task per session; the task owns its `AnalysisPipeline`.

use crate::analysis_pipeline::{AnalysisPipeline, PipelineConfig, PipelineOutcome};
use crate::connection_hub::ConnectionHub;
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::session_registry::{Session, SessionRegistry, SessionStatus, SessionSummary};
use crate::stream_source::{CaptureOpener, StreamConfig, StreamSource};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Join result shared by every caller waiting on the same pipeline
type PipelineJoin = Shared<BoxFuture<'static, std::result::Result<PipelineOutcome, String>>>;

/// Handle to one spawned pipeline
///
/// The entry stays in the task map until its pipeline has been joined, so a
/// session being stopped still counts as running.
struct AnalysisTask {
    cancel: CancellationToken,
    abort: AbortHandle,
    join: PipelineJoin,
}

impl AnalysisTask {
    fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// AnalysisService instance
pub struct AnalysisService {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    detector: Arc<dyn Detector>,
    opener: Arc<dyn CaptureOpener>,
    pipeline_config: PipelineConfig,
    stream_config: StreamConfig,
    tasks: Mutex<HashMap<String, AnalysisTask>>,
}

impl AnalysisService {
    /// Create new AnalysisService
    pub fn new(
        hub: Arc<ConnectionHub>,
        detector: Arc<dyn Detector>,
        opener: Arc<dyn CaptureOpener>,
        pipeline_config: PipelineConfig,
        stream_config: StreamConfig,
    ) -> Self {
        Self {
            registry: hub.registry().clone(),
            hub,
            detector,
            opener,
            pipeline_config,
            stream_config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start analysing `stream_url`
    ///
    /// A missing `session_id` gets a fresh UUID. Fails with `Config` on a
    /// malformed address and `Conflict` when the session is already running
    /// or has finished.
    pub async fn start(
        &self,
        session_id: Option<String>,
        stream_url: &str,
        enable_drawing: bool,
    ) -> Result<Session> {
        let stream_url = stream_url.trim();
        if stream_url.is_empty() {
            return Err(Error::Validation("stream_url is required".to_string()));
        }

        let session_id = match session_id.map(|s| s.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        // Address errors surface here, before anything is registered
        let source = StreamSource::new(stream_url, self.opener.clone(), self.stream_config)?;

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());

        if tasks.contains_key(&session_id) {
            return Err(Error::Conflict(format!(
                "Session {} is already running",
                session_id
            )));
        }
        if let Some(existing) = self.registry.get(&session_id).await {
            if existing.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "Session {} has already finished",
                    session_id
                )));
            }
        }

        self.registry.ensure(&session_id, stream_url).await;
        self.registry.set_stream_url(&session_id, stream_url).await;
        self.registry
            .set_status(&session_id, SessionStatus::Pending)
            .await;
        let session = self.registry.ensure(&session_id, stream_url).await;

        let mut config = self.pipeline_config.clone();
        if !enable_drawing {
            config.frame_quality = 0;
        }

        let pipeline = AnalysisPipeline::new(
            &session_id,
            source,
            self.detector.clone(),
            self.hub.clone(),
            config,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pipeline.run(cancel.clone()));
        let abort = handle.abort_handle();
        let join = handle.map(|joined| joined.map_err(|e| e.to_string())).boxed().shared();

        tasks.insert(session_id.clone(), AnalysisTask { cancel, abort, join });

        tracing::info!(
            session_id = %session_id,
            url = %stream_url,
            enable_drawing,
            "Analysis session launched"
        );

        Ok(session)
    }

    /// Cancel a session and wait for its cleanup
    ///
    /// Unknown ids are recorded as stopped.
    pub async fn stop(&self, session_id: &str) -> Result<Session> {
        let join = self.tasks.lock().await.get(session_id).map(|task| {
            task.cancel.cancel();
            task.join.clone()
        });

        if let Some(join) = join {
            match join.await {
                Ok(outcome) => {
                    tracing::debug!(session_id = %session_id, outcome = ?outcome, "Pipeline joined");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Pipeline task aborted");
                }
            }
            self.tasks.lock().await.remove(session_id);
        }

        self.registry
            .set_status(session_id, SessionStatus::Stopped)
            .await;
        Ok(self.registry.ensure(session_id, "").await)
    }

    /// Every known session, in creation order
    pub async fn list(&self) -> Vec<SessionSummary> {
        self.registry.list_active().await
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))
    }

    /// Whether a pipeline task is live for the session
    pub async fn is_running(&self, session_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(session_id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel every pipeline and wait for all of them
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, AnalysisTask)> = self.tasks.lock().await.drain().collect();
        if tasks.is_empty() {
            return;
        }

        tracing::info!(sessions = tasks.len(), "Stopping all analysis sessions");

        for (_, task) in &tasks {
            task.cancel.cancel();
        }
        for (session_id, task) in tasks {
            if let Err(e) = task.join.await {
                tracing::warn!(session_id = %session_id, error = %e, "Pipeline task aborted");
            }
        }
    }
}
