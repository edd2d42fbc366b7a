//! Application state
//!
//! Holds all shared components and state

use crate::analysis_pipeline::PipelineConfig;
use crate::analysis_service::AnalysisService;
use crate::connection_hub::ConnectionHub;
use crate::detector::Detector;
use crate::session_registry::SessionRegistry;
use crate::stream_source::{CaptureOpener, StreamConfig};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prefix shared by every environment key
pub const ENV_PREFIX: &str = "DETSTREAM_";

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Inference server base URL
    pub detector_url: String,
    pub detector_timeout_secs: u64,
    /// Detector-level cutoff; weaker detections are never reported
    pub confidence_threshold: f32,
    /// Annotated frame JPEG quality (0 = no annotated frames)
    pub frame_quality: u8,
    pub max_frame_width: u32,
    pub alert_enabled: bool,
    /// Pipeline alert gate
    pub alert_confidence_threshold: f32,
    /// Connect/read stall limit (0 = wait forever)
    pub stream_timeout_secs: u64,
    /// Per-subscriber queue length
    pub subscriber_buffer: usize,
    pub subscriber_send_timeout_ms: u64,
    /// Frame cap per session
    pub max_frames: Option<u64>,
}

impl AppConfig {
    /// Build from a key lookup; keys are given without the prefix
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(get("PORT"), 8080),
            detector_url: get("DETECTOR_URL")
                .unwrap_or_else(|| "http://localhost:9000".to_string()),
            detector_timeout_secs: parse_or(get("DETECTOR_TIMEOUT_SECS"), 30),
            confidence_threshold: parse_or(get("CONFIDENCE_THRESHOLD"), 0.5),
            frame_quality: parse_or::<u8>(get("FRAME_QUALITY"), 70).min(100),
            max_frame_width: parse_or(get("MAX_FRAME_WIDTH"), 800),
            alert_enabled: get("ALERT_ENABLED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            alert_confidence_threshold: parse_or(get("ALERT_CONFIDENCE_THRESHOLD"), 0.7),
            stream_timeout_secs: parse_or(get("STREAM_TIMEOUT_SECS"), 30),
            subscriber_buffer: parse_or(get("SUBSCRIBER_BUFFER"), 64),
            subscriber_send_timeout_ms: parse_or(get("SUBSCRIBER_SEND_TIMEOUT_MS"), 5000),
            max_frames: get("MAX_FRAMES").and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            frame_quality: self.frame_quality,
            max_frame_width: self.max_frame_width,
            alert_enabled: self.alert_enabled,
            alert_confidence_threshold: self.alert_confidence_threshold,
            max_frames: self.max_frames,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::with_timeout_secs(self.stream_timeout_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout_secs)
    }

    pub fn subscriber_send_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_send_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// SessionRegistry (session SSoT)
    pub registry: Arc<SessionRegistry>,
    /// ConnectionHub (WebSocket fan-out)
    pub hub: Arc<ConnectionHub>,
    /// AnalysisService (session control)
    pub service: Arc<AnalysisService>,
    /// Detector (inference server adapter)
    pub detector: Arc<dyn Detector>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl AppState {
    /// Wire up every component
    pub fn new(
        config: AppConfig,
        detector: Arc<dyn Detector>,
        opener: Arc<dyn CaptureOpener>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new(
            registry.clone(),
            config.subscriber_send_timeout(),
        ));
        let service = Arc::new(AnalysisService::new(
            hub.clone(),
            detector.clone(),
            opener,
            config.pipeline_config(),
            config.stream_config(),
        ));

        Self {
            config,
            registry,
            hub,
            service,
            detector,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
