//! AnalysisPipeline - Per-Session Analysis Loop
//!
//! ## Responsibilities
//!
//! - Connect the session's stream source
//! - Per frame: detect → annotate/resize/encode → broadcast → alerts
//! - Session status updates (running, error, stopped)
//! - Cleanup on every exit path, including cancellation
//!
//! ## Message order
//!
//! ```text
//! status(running) → stream_info → { frame_result → alert* }* → [error] → status(stopped)
//! ```
//!
//! Cancellation is checked before every connect and read, never in the
//! middle of a frame.


use crate::connection_hub::{epoch_seconds, ConnectionHub};
use crate::detector::{Detection, Detector};
use crate::error::{Error, Result};
use crate::frame_transform;
use crate::session_registry::SessionStatus;
use crate::stream_source::{Frame, StreamSource};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-session pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// JPEG quality for annotated frames; 0 disables the payload
    pub frame_quality: u8,
    /// Annotated frames wider than this are scaled down
    pub max_frame_width: u32,
    pub alert_enabled: bool,
    /// Detections at or above this confidence raise an alert
    pub alert_confidence_threshold: f32,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_quality: 70,
            max_frame_width: 800,
            alert_enabled: true,
            alert_confidence_threshold: 0.7,
            max_frames: None,
        }
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// End of stream or frame limit reached
    Completed { frames: u64 },
    /// Cancellation token fired
    Cancelled { frames: u64 },
    /// Terminated by an error (already broadcast)
    Failed { message: String },
}

/// Pipeline for one session
pub struct AnalysisPipeline {
    session_id: String,
    source: StreamSource,
    detector: Arc<dyn Detector>,
    hub: Arc<ConnectionHub>,
    config: PipelineConfig,
}

impl AnalysisPipeline {
    pub fn new(
        session_id: &str,
        source: StreamSource,
        detector: Arc<dyn Detector>,
        hub: Arc<ConnectionHub>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            source,
            detector,
            hub,
            config,
        }
    }

    /// Run to completion; always leaves the session `Stopped`
    pub async fn run(mut self, cancel: CancellationToken) -> PipelineOutcome {
        let session_id = self.session_id.clone();
        let hub = self.hub.clone();
        let registry = hub.registry().clone();

        registry.set_status(&session_id, SessionStatus::Running).await;
        hub.send_status(&session_id, SessionStatus::Running, "Analysis started")
            .await;
        tracing::info!(
            session_id = %session_id,
            url = %self.source.url(),
            "Analysis started"
        );

        let mut frames = 0u64;
        let result = self.process(&cancel, &mut frames).await;

        self.source.stop();

        let outcome = match result {
            Ok(false) => PipelineOutcome::Completed { frames },
            Ok(true) => PipelineOutcome::Cancelled { frames },
            Err(e) => {
                let message = client_message(&e);
                tracing::error!(session_id = %session_id, error = %e, frames, "Analysis failed");
                registry.set_status(&session_id, SessionStatus::Error).await;
                hub.send_error(&session_id, &message).await;
                PipelineOutcome::Failed { message }
            }
        };

        registry.set_status(&session_id, SessionStatus::Stopped).await;
        hub.send_status(&session_id, SessionStatus::Stopped, "Analysis stopped")
            .await;
        tracing::info!(session_id = %session_id, outcome = ?outcome, "Analysis stopped");

        outcome
    }

    /// Connect and run the frame loop; `Ok(true)` when cancelled
    async fn process(&mut self, cancel: &CancellationToken, frames: &mut u64) -> Result<bool> {
        let info = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(true),
            connected = self.source.connect() => connected?,
        };
        self.hub.send_stream_info(&self.session_id, info).await;

        let mut stream = Box::pin(self.source.produce_frames(self.config.max_frames));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                next = stream.next() => next,
            };
            let Some(frame) = next else {
                return Ok(false);
            };

            handle_frame(
                &self.session_id,
                frame?,
                self.detector.as_ref(),
                &self.hub,
                &self.config,
            )
            .await?;
            *frames += 1;
        }
    }
}

/// Detect, render and broadcast one frame
async fn handle_frame(
    session_id: &str,
    frame: Frame,
    detector: &dyn Detector,
    hub: &ConnectionHub,
    config: &PipelineConfig,
) -> Result<()> {
    let detections = detector.detect(&frame.image).await?;
    let timestamp = epoch_seconds(frame.captured_at);
    let frame_index = frame.frame_index;

    let annotated_frame = if config.frame_quality > 0 {
        Some(render(frame, detections.clone(), config).await?)
    } else {
        None
    };

    tracing::debug!(
        session_id = %session_id,
        frame_index,
        detections = detections.len(),
        "Frame processed"
    );

    hub.send_frame_result(
        session_id,
        frame_index,
        timestamp,
        annotated_frame,
        detections.clone(),
    )
    .await;

    if config.alert_enabled {
        for detection in &detections {
            hub.send_alert(session_id, detection, config.alert_confidence_threshold)
                .await;
        }
    }

    Ok(())
}

/// Annotate, resize and encode off the async scheduler
async fn render(frame: Frame, detections: Vec<Detection>, config: &PipelineConfig) -> Result<String> {
    let max_width = config.max_frame_width;
    let quality = config.frame_quality;

    tokio::task::spawn_blocking(move || {
        frame_transform::render_frame(&frame.image, &detections, max_width, quality)
    })
    .await
    .map_err(|e| Error::Internal(format!("Frame render task failed: {}", e)))?
}

/// Text sent to subscribers in the error message
fn client_message(error: &Error) -> String {
    match error {
        Error::Connect(msg) => format!("Failed to connect to video stream: {}", msg),
        Error::Read(msg) => format!("Failed to read from video stream: {}", msg),
        other => other.to_string(),
    }
}
