use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sb_core::types::{ControlMessage, CreateSessionRequest};
use sb_session::{OutputSink, Session, SinkError};
use sb_telemetry::tracing_setup::ConnectionSpan;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::api_error::ApiError;
use crate::http_api::ApiState;

/// Heartbeat interval for terminal WebSocket connections.
/// Sends a Ping frame to detect half-open TCP connections.
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsSender = SplitSink<WebSocket, Message>;

/// Query parameters used when the connection itself creates the session.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    pub shell: Option<String>,
    pub cwd: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound sink
// ---------------------------------------------------------------------------

/// Sends PTY chunks to the connection as binary frames.
///
/// The sender is shared with the heartbeat task; the mutex serialises
/// whole frames so a Ping never lands inside an output write.
pub struct WsSink {
    sender: Arc<Mutex<WsSender>>,
}

#[async_trait]
impl OutputSink for WsSink {
    async fn send_output(&self, chunk: Vec<u8>) -> Result<(), SinkError> {
        self.sender
            .lock()
            .await
            .send(Message::Binary(chunk.into()))
            .await
            .map_err(|e| SinkError::TransportSendFailed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Upgrade handler
// ---------------------------------------------------------------------------

/// GET /ws/terminal/{id} -- WebSocket for terminal I/O.
///
/// A registered session is attached if no other connection holds it. An
/// unknown id creates the session here, so spawn failures are reported as
/// HTTP errors before the upgrade.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    match state.manager.get_session(&id).await {
        Ok(session) if session.is_attached() => {
            return ApiError::Conflict(format!("session {id} already has a connection"))
                .into_response();
        }
        Ok(_) => {}
        Err(_) => {
            let req = CreateSessionRequest {
                shell_selector: query.shell,
                working_directory: query.cwd,
                ..Default::default()
            };
            let spec = match state.session_spec(&req) {
                Ok(spec) => spec,
                Err(e) => return e.into_response(),
            };
            if let Err(e) = state.manager.spawn_session(id.clone(), &spec).await {
                return ApiError::from(e).into_response();
            }
            tracing::info!(session_id = %id, "session created on connect");
        }
    }

    let failed_state = Arc::clone(&state);
    let failed_id = id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(session_id = %failed_id, error = %e, "websocket upgrade failed");
        tokio::spawn(async move {
            let session = failed_state.manager.get_session(&failed_id).await;
            if matches!(session, Ok(ref s) if !s.is_attached()) {
                failed_state.manager.close_session(&failed_id).await;
            }
        });
    })
    .on_upgrade(move |socket| async move {
        let connection = ConnectionSpan::open("terminal_ws", &id);
        let outcome = handle_terminal_ws(socket, state, id)
            .instrument(connection.span())
            .await;
        connection.finish(outcome);
    })
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Run one connection to completion and report how it ended.
async fn handle_terminal_ws(
    socket: WebSocket,
    state: Arc<ApiState>,
    session_id: String,
) -> &'static str {
    let (ws_sender, mut ws_receiver) = socket.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));

    let sink = Arc::new(WsSink {
        sender: Arc::clone(&ws_sender),
    });
    let session = match state.manager.attach(&session_id, sink).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "attach failed");
            send_close(&ws_sender, close_code::POLICY, e.to_string()).await;
            return "attach_failed";
        }
    };

    // Task: WS -> PTY input.
    let inbound_session = Arc::clone(&session);
    let mut inbound = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket receive error");
                    break;
                }
            };
            let keep_going = match msg {
                Message::Binary(data) => write_input(&inbound_session, &data),
                Message::Text(text) => handle_text(&inbound_session, text.as_str()),
                Message::Close(_) => false,
                _ => true,
            };
            if !keep_going {
                break;
            }
        }
    });

    // Task: Heartbeat -- Ping every 30s through the shared write lock.
    let heartbeat_sender = Arc::clone(&ws_sender);
    let mut heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if heartbeat_sender
                .lock()
                .await
                .send(Message::Ping(Vec::new().into()))
                .await
                .is_err()
            {
                tracing::debug!("heartbeat ping failed, connection lost");
                break;
            }
        }
    });

    let session_ended = tokio::select! {
        _ = &mut inbound => false,
        _ = &mut heartbeat => false,
        _ = session.closed() => true,
    };
    inbound.abort();
    heartbeat.abort();

    let outcome = if session_ended {
        tracing::info!(%session_id, "session ended, closing connection");
        send_close(&ws_sender, close_code::NORMAL, "session closed".to_string()).await;
        "session_ended"
    } else {
        tracing::info!(%session_id, "connection ended, closing session");
        "connection_ended"
    };
    state.manager.close_session(&session_id).await;
    outcome
}

/// Apply one text frame: a JSON control message, or raw input otherwise.
fn handle_text(session: &Session, text: &str) -> bool {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Input { data }) => write_input(session, data.as_bytes()),
        Ok(ControlMessage::Resize { rows, cols }) => {
            if let Err(e) = session.resize(rows, cols) {
                tracing::warn!(session_id = %session.id(), "PTY resize failed: {e}");
            }
            true
        }
        Ok(ControlMessage::PromptWatcher { enabled }) => {
            session.set_prompt_watcher(enabled);
            true
        }
        Err(_) => write_input(session, text.as_bytes()),
    }
}

/// One received message is one write. A failed write means the PTY is
/// gone, which ends the connection.
fn write_input(session: &Session, data: &[u8]) -> bool {
    match session.write(data) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "PTY write failed");
            false
        }
    }
}

async fn send_close(sender: &Mutex<WsSender>, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sender.lock().await.send(Message::Close(Some(frame))).await;
}
