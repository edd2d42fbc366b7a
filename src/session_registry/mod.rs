//! SessionRegistry - Session State SSoT
//!
//! ## Responsibilities
//!
//! - One record per session id (created lazily on first reference)
//! - Status state machine (pending → running → stopped, running → error → stopped)
//! - Frame counters and stream URLs
//! - Insertion-ordered snapshots for status queries
//!
//! All operations go through an internal lock; callers never lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet streaming
    Pending,
    /// Ingestion loop active
    Running,
    /// Terminal
    Stopped,
    /// Failed; settles to Stopped after cleanup
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether `next` is reachable from this status.
    ///
    /// Re-setting the current status is always accepted, except that
    /// nothing leaves `Stopped`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Stopped, Stopped) => true,
            (Stopped, _) => false,
            (a, b) if *a == b => true,
            (Pending, Running) | (Pending, Stopped) | (Pending, Error) => true,
            (Running, Stopped) | (Running, Error) => true,
            (Error, Stopped) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lossy parse: anything unrecognised becomes `Error`
impl From<&str> for SessionStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Error,
        }
    }
}

/// Analysis session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub stream_url: String,
    pub status: SessionStatus,
    pub frame_count: u64,
    pub created_at: DateTime<Utc>,
    /// Set on the first transition into `Running`
    pub start_time: Option<DateTime<Utc>>,
}

impl Session {
    fn new(session_id: &str, stream_url: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            stream_url: stream_url.to_string(),
            status: SessionStatus::Pending,
            frame_count: 0,
            created_at: Utc::now(),
            start_time: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            frame_count: self.frame_count,
            stream_url: self.stream_url.clone(),
        }
    }
}

/// Row returned by `list_active`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub frame_count: u64,
    pub stream_url: String,
}

/// Sessions plus their insertion order
#[derive(Default)]
struct SessionTable {
    order: Vec<String>,
    sessions: HashMap<String, Session>,
}

impl SessionTable {
    fn ensure(&mut self, session_id: &str, stream_url: &str) -> &mut Session {
        if !self.sessions.contains_key(session_id) {
            self.order.push(session_id.to_string());
            tracing::debug!(session_id = %session_id, "Session created");
        }

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, stream_url));

        // Only fill a missing URL, never erase one
        if !stream_url.is_empty() && session.stream_url.is_empty() {
            session.stream_url = stream_url.to_string();
        }

        session
    }
}

/// SessionRegistry instance
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
}

impl SessionRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
        }
    }

    /// Get or create a session
    ///
    /// An empty `stream_url` never overwrites a URL already on record.
    pub async fn ensure(&self, session_id: &str, stream_url: &str) -> Session {
        let mut table = self.table.write().await;
        table.ensure(session_id, stream_url).clone()
    }

    /// Apply a status transition
    ///
    /// Invalid transitions are logged and ignored. Returns the status on
    /// record after the call.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> SessionStatus {
        let mut table = self.table.write().await;
        let session = table.ensure(session_id, "");
        let prev = session.status;

        if !prev.can_transition_to(status) {
            tracing::warn!(
                session_id = %session_id,
                from = %prev,
                to = %status,
                "Rejected session status transition"
            );
            return prev;
        }

        session.status = status;
        if status == SessionStatus::Running && session.start_time.is_none() {
            session.start_time = Some(Utc::now());
        }

        if prev != status {
            tracing::info!(
                session_id = %session_id,
                from = %prev,
                to = %status,
                "Session status changed"
            );
        }

        status
    }

    /// Status update from a loose string (unknown values become `Error`)
    pub async fn set_status_str(&self, session_id: &str, status: &str) -> SessionStatus {
        self.set_status(session_id, SessionStatus::from(status)).await
    }

    /// Replace the stream URL
    pub async fn set_stream_url(&self, session_id: &str, stream_url: &str) {
        let mut table = self.table.write().await;
        let session = table.ensure(session_id, stream_url);
        if !stream_url.is_empty() {
            session.stream_url = stream_url.to_string();
        }
    }

    /// Bump the frame counter, returning the new count
    pub async fn increment_frame_count(&self, session_id: &str) -> u64 {
        let mut table = self.table.write().await;
        let session = table.ensure(session_id, "");
        session.frame_count += 1;
        session.frame_count
    }

    /// Look up a session without creating it
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let table = self.table.read().await;
        table.sessions.get(session_id).cloned()
    }

    /// Snapshot of every known session, in insertion order
    pub async fn list_active(&self) -> Vec<SessionSummary> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.sessions.get(id))
            .map(Session::summary)
            .collect()
    }

    /// Number of known sessions
    pub async fn len(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    /// Number of sessions currently `Running`
    pub async fn running_count(&self) -> usize {
        let table = self.table.read().await;
        table
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
