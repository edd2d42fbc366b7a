//! ConnectionHub - Per-Session Subscriber Fan-Out
//!
//! ## Responsibilities
//!
//! - Session id → live subscribers
//! - Best-effort broadcast (serialize once, send to each)
//! - Dead-subscriber pruning on the first failed send
//! - Typed wrappers for every outbound message
//!
//! Delivery is at-most-once and there is no replay: a subscriber that
//! attaches late only sees messages broadcast after it attached.

use crate::detector::Detection;
use crate::session_registry::{Session, SessionRegistry, SessionStatus};
use crate::stream_source::StreamInfo;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Confidence gate applied by `send_alert` when the caller has no threshold of its own
pub const DEFAULT_ALERT_THRESHOLD: f32 = 0.5;

/// Outbound message, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    StreamInfo(StreamInfoMessage),
    FrameResult(FrameResultMessage),
    Alert(AlertMessage),
    Error(ErrorMessage),
    Status(StatusMessage),
}

impl HubMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StreamInfo(_) => "stream_info",
            Self::FrameResult(_) => "frame_result",
            Self::Alert(_) => "alert",
            Self::Error(_) => "error",
            Self::Status(_) => "status",
        }
    }
}

/// Feed metadata, sent once after connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfoMessage {
    pub session_id: String,
    pub timestamp: f64,
    pub info: StreamInfo,
}

/// Per-frame detections plus the optional annotated JPEG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResultMessage {
    pub session_id: String,
    /// Capture time of the frame
    pub timestamp: f64,
    pub frame_index: u64,
    /// Base64 JPEG; null when frame output is disabled
    pub annotated_frame: Option<String>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub session_id: String,
    pub timestamp: f64,
    pub data: AlertData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertData {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub session_id: String,
    pub timestamp: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub session_id: String,
    pub timestamp: f64,
    pub status: SessionStatus,
    pub message: String,
}

/// Seconds since the epoch with millisecond precision
pub fn epoch_seconds(at: chrono::DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn now() -> f64 {
    epoch_seconds(Utc::now())
}

/// Send side of one subscriber
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    /// New subscriber plus the receiving end its transport drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// ConnectionHub instance
pub struct ConnectionHub {
    registry: Arc<SessionRegistry>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    send_timeout: Duration,
}

impl ConnectionHub {
    /// Create new ConnectionHub
    pub fn new(registry: Arc<SessionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Add a subscriber to a session, creating the session if needed
    pub async fn attach(&self, session_id: &str, subscriber: Subscriber) -> Session {
        let session = self.registry.ensure(session_id, "").await;
        let subscriber_id = subscriber.id;

        let count = {
            let mut subscribers = self.subscribers.write().await;
            let entry = subscribers.entry(session_id.to_string()).or_default();
            entry.push(subscriber);
            entry.len()
        };

        tracing::info!(
            session_id = %session_id,
            subscriber_id = %subscriber_id,
            subscribers = count,
            "Subscriber attached"
        );
        session
    }

    /// Remove a subscriber and mark the session stopped
    pub async fn detach(&self, session_id: &str, subscriber_id: Uuid) {
        {
            let mut subscribers = self.subscribers.write().await;
            if let Some(entry) = subscribers.get_mut(session_id) {
                entry.retain(|s| s.id != subscriber_id);
                if entry.is_empty() {
                    subscribers.remove(session_id);
                }
            }
        }

        if self.registry.get(session_id).await.is_some() {
            self.registry
                .set_status(session_id, SessionStatus::Stopped)
                .await;
        }

        tracing::info!(
            session_id = %session_id,
            subscriber_id = %subscriber_id,
            "Subscriber detached"
        );
    }

    /// Drop every subscriber; transports see their channel close
    pub async fn close_all(&self) {
        let dropped: usize = {
            let mut subscribers = self.subscribers.write().await;
            let count = subscribers.values().map(Vec::len).sum();
            subscribers.clear();
            count
        };
        tracing::info!(subscribers = dropped, "All subscribers closed");
    }

    /// Number of live subscribers on a session
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Send a message to every subscriber of a session
    ///
    /// Failed subscribers are pruned; failures never reach the caller.
    pub async fn broadcast(&self, session_id: &str, message: &HubMessage) {
        // Snapshot so no lock is held across sends
        let targets: Vec<Subscriber> = match self.subscribers.read().await.get(session_id) {
            Some(entry) if !entry.is_empty() => entry.clone(),
            _ => return,
        };

        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to serialize message");
                return;
            }
        };

        tracing::debug!(
            session_id = %session_id,
            message_type = message.type_name(),
            subscribers = targets.len(),
            "Broadcasting"
        );

        let mut failed = Vec::new();
        for subscriber in &targets {
            if let Err(e) = subscriber.tx.send_timeout(json.clone(), self.send_timeout).await {
                tracing::warn!(
                    session_id = %session_id,
                    subscriber_id = %subscriber.id,
                    error = %e,
                    "Send failed, pruning subscriber"
                );
                failed.push(subscriber.id);
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            if let Some(entry) = subscribers.get_mut(session_id) {
                entry.retain(|s| !failed.contains(&s.id));
                if entry.is_empty() {
                    subscribers.remove(session_id);
                }
            }
        }
    }

    pub async fn send_stream_info(&self, session_id: &str, info: StreamInfo) {
        let message = HubMessage::StreamInfo(StreamInfoMessage {
            session_id: session_id.to_string(),
            timestamp: now(),
            info,
        });
        self.broadcast(session_id, &message).await;
    }

    /// Broadcast a frame result and count the frame
    pub async fn send_frame_result(
        &self,
        session_id: &str,
        frame_index: u64,
        timestamp: f64,
        annotated_frame: Option<String>,
        detections: Vec<Detection>,
    ) {
        let message = HubMessage::FrameResult(FrameResultMessage {
            session_id: session_id.to_string(),
            timestamp,
            frame_index,
            annotated_frame,
            detections,
        });
        self.broadcast(session_id, &message).await;
        self.registry.increment_frame_count(session_id).await;
    }

    /// Broadcast an alert when `detection` meets `threshold`
    ///
    /// Returns whether the alert passed the gate.
    pub async fn send_alert(&self, session_id: &str, detection: &Detection, threshold: f32) -> bool {
        if detection.confidence < threshold {
            return false;
        }

        let message = HubMessage::Alert(AlertMessage {
            session_id: session_id.to_string(),
            timestamp: now(),
            data: AlertData {
                class_name: detection.class_name.clone(),
                confidence: detection.confidence,
                bbox: detection.bbox,
            },
        });
        self.broadcast(session_id, &message).await;
        true
    }

    pub async fn send_error(&self, session_id: &str, message: &str) {
        let message = HubMessage::Error(ErrorMessage {
            session_id: session_id.to_string(),
            timestamp: now(),
            message: message.to_string(),
        });
        self.broadcast(session_id, &message).await;
    }

    pub async fn send_status(&self, session_id: &str, status: SessionStatus, message: &str) {
        let message = HubMessage::Status(StatusMessage {
            session_id: session_id.to_string(),
            timestamp: now(),
            status,
            message: message.to_string(),
        });
        self.broadcast(session_id, &message).await;
    }
}
