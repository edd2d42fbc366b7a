//! Request and response bodies for the HTTP API

use crate::session_registry::{Session, SessionStatus};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Start-analysis request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub stream_url: String,
    /// Whether frame results carry an annotated JPEG
    #[serde(default = "default_true")]
    pub enable_drawing: bool,
    /// Caller-chosen session id; generated when absent
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Start/stop response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStopRequest {
    pub session_id: String,
}

/// Session detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub frame_count: u64,
    pub stream_url: String,
    /// RFC 3339; absent until the pipeline has started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.session_id,
            status: session.status,
            frame_count: session.frame_count,
            stream_url: session.stream_url,
            start_time: session.start_time.map(|t| t.to_rfc3339()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub detector_connected: bool,
    /// Sessions currently running
    pub active_sessions: usize,
    pub uptime_seconds: u64,
}
