//! StreamSource - Live Feed Frame Ingestion
//!
//! ## Responsibilities
//!
//! - Address family selection (pull-based RTSP vs HTTP-delivered container)
//! - Connect / stream info / sequential frame reads
//! - Blocking reads on one dedicated worker thread per source
//! - Idempotent stop that releases the capture handle
//!
//! ```text
//!   async caller                      capture worker (std::thread)
//!   ────────────                      ───────────────────────────
//!   connect() ──── spawn ───────────► opener.open(url, kind)
//!             ◄─── ready(info) ─────┘
//!   next_frame() ─ Read(reply) ─────► capture.read()  (blocking)
//!             ◄─── Frame ───────────┘
//!   stop() ─────── Close ───────────► capture.close()
//! ```

mod capture;

pub use capture::{CaptureOpener, FfmpegOpener, VideoCapture};

use chrono::{DateTime, Utc};
use futures::Stream;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Stream source errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Malformed feed address
    #[error("invalid stream address: {0}")]
    Config(String),
    /// Feed could not be opened
    #[error("failed to connect to video stream: {0}")]
    Connect(String),
    /// Feed failed mid-stream
    #[error("failed to read from video stream: {0}")]
    Read(String),
    /// Source already stopped
    #[error("stream source stopped")]
    Stopped,
}

/// Feed address family, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Pull-based RTSP; read over TCP to avoid UDP packet loss
    Rtsp,
    /// Generic HTTP-delivered container (HLS, MJPEG, progressive MP4, ...)
    Http,
}

impl StreamKind {
    /// Select the address family from the URL scheme
    ///
    /// `rtsp`/`rtsps` select the pull protocol, any other well-formed
    /// `scheme://target` is treated as HTTP-delivered.
    pub fn from_url(url: &str) -> Result<Self, StreamError> {
        let (scheme, rest) = url
            .trim()
            .split_once("://")
            .ok_or_else(|| StreamError::Config(format!("missing scheme in '{}'", url)))?;

        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(StreamError::Config(format!("invalid scheme '{}'", scheme)));
        }
        if rest.trim().is_empty() {
            return Err(StreamError::Config(format!("missing host in '{}'", url)));
        }

        match scheme.to_ascii_lowercase().as_str() {
            "rtsp" | "rtsps" => Ok(Self::Rtsp),
            _ => Ok(Self::Http),
        }
    }

    /// Transport hint passed to the decoder
    pub fn transport_hint(&self) -> Option<&'static str> {
        match self {
            Self::Rtsp => Some("tcp"),
            Self::Http => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Http => "http",
        }
    }
}

/// Feed metadata
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Wall clock at read time
    pub captured_at: DateTime<Utc>,
    /// Starts at 1, strictly increasing per source
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(image: RgbImage, frame_index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            captured_at: Utc::now(),
            frame_index,
            width,
            height,
        }
    }
}

/// Stream timeouts
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConfig {
    /// Limit on opening the feed (None = wait forever)
    pub connect_timeout: Option<Duration>,
    /// Limit on a single frame read (None = wait forever)
    pub read_timeout: Option<Duration>,
}

impl StreamConfig {
    /// Same limit for connect and reads; zero disables both
    pub fn with_timeout_secs(secs: u64) -> Self {
        let limit = (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            connect_timeout: limit,
            read_timeout: limit,
        }
    }
}

enum WorkerCommand {
    Read(oneshot::Sender<Result<Option<Frame>, StreamError>>),
    Close,
}

/// Handle to the dedicated capture thread
struct CaptureWorker {
    commands: mpsc::Sender<WorkerCommand>,
}

/// Cloneable handle that makes `produce_frames` end at the next frame boundary
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Frame source for one live feed
pub struct StreamSource {
    url: String,
    kind: StreamKind,
    opener: Arc<dyn CaptureOpener>,
    config: StreamConfig,
    worker: Option<CaptureWorker>,
    info: Option<StreamInfo>,
    stopped: Arc<AtomicBool>,
}

impl StreamSource {
    /// Create a source; fails with `Config` on a malformed address
    pub fn new(
        url: &str,
        opener: Arc<dyn CaptureOpener>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        let kind = StreamKind::from_url(url)?;
        Ok(Self {
            url: url.trim().to_string(),
            kind,
            opener,
            config,
            worker: None,
            info: None,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Feed metadata, available once connected
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.info
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stopped.clone())
    }

    /// Open the feed on a fresh capture worker
    pub async fn connect(&mut self) -> Result<StreamInfo, StreamError> {
        if self.is_stopped() {
            return Err(StreamError::Stopped);
        }
        if let Some(info) = self.info {
            return Ok(info);
        }

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let opener = self.opener.clone();
        let url = self.url.clone();
        let kind = self.kind;

        std::thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(move || worker_loop(opener, url, kind, ready_tx, command_rx))
            .map_err(|e| StreamError::Connect(format!("failed to spawn capture worker: {}", e)))?;
        self.worker = Some(CaptureWorker { commands });

        let ready = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(ready) => ready,
                Err(_) => {
                    self.release();
                    return Err(StreamError::Connect(format!(
                        "timed out after {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => ready_rx.await,
        };

        match ready {
            Ok(Ok(info)) => {
                tracing::info!(
                    url = %self.url,
                    kind = self.kind.as_str(),
                    width = info.width,
                    height = info.height,
                    fps = info.fps,
                    "Stream connected"
                );
                self.info = Some(info);
                Ok(info)
            }
            Ok(Err(e)) => {
                self.release();
                Err(e)
            }
            Err(_) => {
                self.release();
                Err(StreamError::Connect("capture worker exited".to_string()))
            }
        }
    }

    /// Read the next frame; `Ok(None)` at end-of-stream or after stop
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        if self.is_stopped() {
            self.release();
            return Ok(None);
        }

        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| StreamError::Read("stream not connected".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .commands
            .send(WorkerCommand::Read(reply_tx))
            .map_err(|_| StreamError::Read("capture worker gone".to_string()))?;

        let reply = match self.config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx).await.map_err(|_| {
                StreamError::Read(format!("no frame within {}s", limit.as_secs()))
            })?,
            None => reply_rx.await,
        };

        reply.map_err(|_| StreamError::Read("capture worker exited".to_string()))?
    }

    /// Frames until stop, end-of-stream or `max_frames`, whichever is first
    ///
    /// A read error is yielded once and ends the sequence.
    pub fn produce_frames(
        &mut self,
        max_frames: Option<u64>,
    ) -> impl Stream<Item = Result<Frame, StreamError>> + '_ {
        futures::stream::unfold((self, 0u64, false), move |(source, produced, done)| async move {
            if done || max_frames.is_some_and(|max| produced >= max) {
                return None;
            }
            match source.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), (source, produced + 1, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (source, produced, true))),
            }
        })
    }

    /// Cancel future reads and release the capture handle; idempotent
    pub fn stop(&mut self) {
        let was_stopped = self.stopped.swap(true, Ordering::SeqCst);
        self.release();
        if !was_stopped {
            tracing::debug!(url = %self.url, "Stream source stopped");
        }
    }

    fn release(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Queued behind any in-flight read
            let _ = worker.commands.send(WorkerCommand::Close);
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    opener: Arc<dyn CaptureOpener>,
    url: String,
    kind: StreamKind,
    ready: oneshot::Sender<Result<StreamInfo, StreamError>>,
    commands: mpsc::Receiver<WorkerCommand>,
) {
    let mut capture = match opener.open(&url, kind) {
        Ok(capture) => {
            if ready.send(Ok(capture.info())).is_err() {
                // Caller gave up (timeout) before the feed opened
                let mut capture = capture;
                capture.close();
                return;
            }
            capture
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Stream open failed");
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut frame_index = 0u64;
    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Read(reply) => {
                let result = capture.read().map(|image| {
                    image.map(|image| {
                        frame_index += 1;
                        Frame::new(image, frame_index)
                    })
                });
                let _ = reply.send(result);
            }
            WorkerCommand::Close => break,
        }
    }

    capture.close();
    tracing::debug!(url = %url, frames = frame_index, "Capture worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedOpener;
    use futures::StreamExt;

    fn source(opener: &Arc<ScriptedOpener>) -> StreamSource {
        StreamSource::new("rtsp://cam.local/live", opener.clone(), StreamConfig::default())
            .unwrap()
    }

    #[test]
    fn test_kind_selection() {
        assert_eq!(StreamKind::from_url("rtsp://cam/1").unwrap(), StreamKind::Rtsp);
        assert_eq!(StreamKind::from_url("RTSPS://cam/1").unwrap(), StreamKind::Rtsp);
        assert_eq!(
            StreamKind::from_url("http://cdn/live.m3u8").unwrap(),
            StreamKind::Http
        );
        assert_eq!(StreamKind::from_url("proto://host/cam").unwrap(), StreamKind::Http);
        assert_eq!(StreamKind::Rtsp.transport_hint(), Some("tcp"));
        assert_eq!(StreamKind::Http.transport_hint(), None);
    }

    #[test]
    fn test_kind_rejects_malformed() {
        for bad in ["", "cam.local/live", "://host", "rtsp://", "bad scheme://x"] {
            assert!(
                matches!(StreamKind::from_url(bad), Err(StreamError::Config(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_new_rejects_malformed() {
        let opener = Arc::new(ScriptedOpener::with_frames(1));
        let result = StreamSource::new("not-a-url", opener, StreamConfig::default());
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_timeout_config() {
        let config = StreamConfig::with_timeout_secs(0);
        assert!(config.read_timeout.is_none());

        let config = StreamConfig::with_timeout_secs(30);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_info_only_after_connect() {
        let opener = Arc::new(ScriptedOpener::with_frames(2));
        let mut source = source(&opener);

        assert!(source.stream_info().is_none());
        let info = source.connect().await.unwrap();
        assert_eq!(source.stream_info(), Some(info));
        assert_eq!(info.width, 32);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let opener = Arc::new(ScriptedOpener::unreachable());
        let mut source = source(&opener);

        let result = source.connect().await;
        assert!(matches!(result, Err(StreamError::Connect(_))));
        assert!(source.stream_info().is_none());
    }

    #[tokio::test]
    async fn test_frames_are_indexed_from_one() {
        let opener = Arc::new(ScriptedOpener::with_frames(3));
        let mut source = source(&opener);
        source.connect().await.unwrap();

        let indices: Vec<u64> = source
            .produce_frames(None)
            .map(|f| f.unwrap().frame_index)
            .collect()
            .await;
        assert_eq!(indices, vec![1, 2, 3]);

        // Exhausted feed keeps reporting end-of-stream
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_frames() {
        let opener = Arc::new(ScriptedOpener::with_frames(5));
        let mut source = source(&opener);
        source.connect().await.unwrap();

        let frames: Vec<Frame> = source
            .produce_frames(Some(3))
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].frame_index, 3);

        source.stop();
        source.stop();
        assert!(source.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_releases_capture() {
        let opener = Arc::new(ScriptedOpener::with_frames(5));
        let mut source = source(&opener);
        source.connect().await.unwrap();
        source.next_frame().await.unwrap();

        source.stop();
        assert!(source.next_frame().await.unwrap().is_none());
        opener.wait_closed().await;
        assert_eq!(opener.close_count(), 1);

        // Dropping after stop doesn't close twice
        drop(source);
        assert_eq!(opener.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_connect() {
        let opener = Arc::new(ScriptedOpener::with_frames(1));
        let mut source = source(&opener);
        source.stop();

        assert_eq!(source.connect().await, Err(StreamError::Stopped));
        assert_eq!(opener.open_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_handle_ends_stream() {
        let opener = Arc::new(ScriptedOpener::with_frames(10));
        let mut source = source(&opener);
        source.connect().await.unwrap();
        let handle = source.stop_handle();

        let mut frames = Box::pin(source.produce_frames(None));
        assert!(frames.next().await.is_some());
        handle.stop();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let opener = Arc::new(ScriptedOpener::with_frames(5).failing_at(2));
        let mut source = source(&opener);
        source.connect().await.unwrap();

        let items: Vec<_> = source.produce_frames(None).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(StreamError::Read(_))));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let opener = Arc::new(ScriptedOpener::with_frames(2).with_read_delay(Duration::from_millis(500)));
        let config = StreamConfig {
            connect_timeout: None,
            read_timeout: Some(Duration::from_millis(50)),
        };
        let mut source = StreamSource::new("http://cam/feed.mjpg", opener.clone(), config).unwrap();
        source.connect().await.unwrap();

        let result = source.next_frame().await;
        assert!(matches!(result, Err(StreamError::Read(_))));
    }
}
