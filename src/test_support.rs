//! Test doubles: scripted capture backend and fixed detector

use crate::connection_hub::Subscriber;
use crate::detector::{Detection, Detector};
use crate::error::{Error, Result};
use crate::stream_source::{CaptureOpener, StreamError, StreamInfo, StreamKind, VideoCapture};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const FRAME_WIDTH: u32 = 32;
pub const FRAME_HEIGHT: u32 = 24;

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Capture backend that plays back a fixed number of synthetic frames
#[derive(Clone)]
pub struct ScriptedOpener {
    frames: usize,
    reachable: bool,
    fail_at: Option<usize>,
    read_delay: Option<Duration>,
    counters: Arc<Counters>,
}

impl ScriptedOpener {
    pub fn with_frames(frames: usize) -> Self {
        Self {
            frames,
            reachable: true,
            fail_at: None,
            read_delay: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Every open fails with a connect error
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::with_frames(0)
        }
    }

    /// Read number `index` (0-based) fails with a read error
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Wait (bounded) until the worker thread has closed the capture
    pub async fn wait_closed(&self) {
        for _ in 0..200 {
            if self.close_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl CaptureOpener for ScriptedOpener {
    fn open(&self, url: &str, _kind: StreamKind) -> std::result::Result<Box<dyn VideoCapture>, StreamError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(StreamError::Connect(format!("{} unreachable", url)));
        }
        Ok(Box::new(ScriptedCapture {
            script: self.clone(),
            reads: 0,
            closed: false,
        }))
    }
}

struct ScriptedCapture {
    script: ScriptedOpener,
    reads: usize,
    closed: bool,
}

impl VideoCapture for ScriptedCapture {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            fps: 25.0,
        }
    }

    fn read(&mut self) -> std::result::Result<Option<RgbImage>, StreamError> {
        if let Some(delay) = self.script.read_delay {
            std::thread::sleep(delay);
        }
        if self.script.fail_at == Some(self.reads) {
            self.reads += 1;
            return Err(StreamError::Read("decoder lost sync".to_string()));
        }
        if self.reads >= self.script.frames {
            return Ok(None);
        }
        self.reads += 1;
        let shade = (self.reads * 20 % 256) as u8;
        Ok(Some(RgbImage::from_pixel(
            FRAME_WIDTH,
            FRAME_HEIGHT,
            Rgb([shade, shade, shade]),
        )))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Detector returning the same detections for every frame
pub struct FixedDetector {
    detections: Vec<Detection>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FixedDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call takes `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for FixedDetector {
    async fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::Detector("inference server returned 503".to_string()));
        }
        Ok(self.detections.clone())
    }

    async fn health_check(&self) -> bool {
        !self.fail
    }
}

/// Subscriber whose receiving end has already gone away
pub fn closed_subscriber() -> Subscriber {
    let (subscriber, rx) = Subscriber::channel(1);
    drop(rx);
    subscriber
}

/// Everything currently queued on a subscriber channel, parsed
pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(text) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str(&text) {
            messages.push(value);
        }
    }
    messages
}

/// `type` tags of parsed messages, with `status` messages expanded to `status:<value>`
pub fn tags(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .map(|m| {
            let tag = m["type"].as_str().unwrap_or_default();
            match tag {
                "status" => format!("status:{}", m["status"].as_str().unwrap_or_default()),
                other => other.to_string(),
            }
        })
        .collect()
}
