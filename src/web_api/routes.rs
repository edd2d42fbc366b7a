//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::analysis_service::AnalysisService;
use crate::connection_hub::Subscriber;
use crate::models::{SessionInfo, VideoRequest, VideoResponse, VideoStopRequest};
use crate::session_registry::SessionStatus;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/v1/video/health", get(super::health_check))
        // Session control
        .route("/api/v1/video/start", post(start_analysis))
        .route("/api/v1/video/stop", post(stop_analysis))
        .route("/api/v1/video/sessions", get(list_sessions))
        .route("/api/v1/video/sessions/:id", get(get_session))
        // WebSocket
        .route("/ws/stream/:session_id", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Session control
// ========================================

/// Start analysing a stream
async fn start_analysis(
    State(state): State<AppState>,
    Json(req): Json<VideoRequest>,
) -> impl IntoResponse {
    match state
        .service
        .start(req.session_id, &req.stream_url, req.enable_drawing)
        .await
    {
        // Launch acknowledgement; the pipeline reports its own status once it runs
        Ok(session) => Json(VideoResponse {
            session_id: session.session_id,
            status: SessionStatus::Running,
            message: "Analysis started successfully".to_string(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Stop a session and wait for its pipeline to finish
async fn stop_analysis(
    State(state): State<AppState>,
    Json(req): Json<VideoStopRequest>,
) -> impl IntoResponse {
    match state.service.stop(&req.session_id).await {
        Ok(session) => Json(VideoResponse {
            session_id: session.session_id,
            status: session.status,
            message: "Analysis stopped".to_string(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list().await)
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.get(&id).await {
        Ok(session) => Json(SessionInfo::from(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

// ========================================
// WebSocket Handler
// ========================================

/// Client → server control message
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlAction {
    Ping,
    Stop,
}

/// Recognised control actions; anything else (including bad JSON) is ignored
fn parse_control(text: &str) -> Option<ControlAction> {
    let message: ControlMessage = serde_json::from_str(text).ok()?;
    if message.kind != "control" {
        return None;
    }
    match message.action.as_deref() {
        Some("ping") => Some(ControlAction::Ping),
        Some("stop") => Some(ControlAction::Stop),
        _ => None,
    }
}

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, session_id, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, session_id: String, state: AppState) {
    let (sender, receiver) = socket.split();
    serve_socket(sender, receiver, session_id, state).await;
}

/// Attach a socket to the session's fan-out until either side ends
async fn serve_socket<S, R>(sender: S, receiver: R, session_id: String, state: AppState)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let (subscriber, rx) = Subscriber::channel(state.config.subscriber_buffer);
    let subscriber_id = subscriber.id();
    state.hub.attach(&session_id, subscriber).await;

    tracing::info!(
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        "WebSocket client connected"
    );

    // Replies to control messages share the socket with hub traffic
    let (reply_tx, reply_rx) = mpsc::channel::<String>(8);

    let mut send_task = tokio::spawn(forward_messages(sender, rx, reply_rx));
    let mut recv_task = tokio::spawn(read_controls(
        receiver,
        session_id.clone(),
        state.service.clone(),
        reply_tx,
    ));

    // Wait for either task to complete, then stop the other
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.detach(&session_id, subscriber_id).await;
}

/// Forward hub messages and control replies to the socket
///
/// Ends when the hub drops the subscriber (pruned or shut down), closing
/// the socket, or when the socket stops accepting writes.
async fn forward_messages<S>(
    mut sender: S,
    mut rx: mpsc::Receiver<String>,
    mut reply_rx: mpsc::Receiver<String>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let text = tokio::select! {
            message = rx.recv() => match message {
                Some(text) => text,
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            Some(text) = reply_rx.recv() => text,
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

/// Handle incoming control messages until the client leaves or asks to stop
async fn read_controls<R>(
    mut receiver: R,
    session_id: String,
    service: Arc<AnalysisService>,
    reply_tx: mpsc::Sender<String>,
) where
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match parse_control(&text) {
                Some(ControlAction::Ping) => {
                    let pong = json!({ "type": "pong" }).to_string();
                    if reply_tx.send(pong).await.is_err() {
                        break;
                    }
                }
                Some(ControlAction::Stop) => {
                    tracing::info!(session_id = %session_id, "Stop requested by client");
                    if let Err(e) = service.stop(&session_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Stop failed");
                    }
                    break;
                }
                None => {
                    tracing::trace!(session_id = %session_id, "Ignoring client message");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = %session_id, "WebSocket client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }
}
