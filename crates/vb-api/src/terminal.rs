//! Terminal bridge: one PTY-backed shell per connection, relayed over a
//! WebSocket.
//!
//! The session loop is transport agnostic: it consumes [`ClientMessage`]s
//! and produces [`ServerMessage`]s over channels. [`ws_session`] adapts a
//! WebSocket to that pair.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vb_db::VpsStore;
use vb_infra::ContainerBackend;
use vb_infra::types::ContainerId;

use crate::auth::{Caller, authenticate_terminal_request};
use crate::error::ApiError;
use crate::pty::{ShellEvent, ShellProcess};
use crate::state::AppState;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

pub const SECURITY_ERROR_PREFIX: &str = "security error:";

// ── Wire format ─────────────────────────────────────────────────────

/// JSON text frames from the client. Binary frames are raw input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Attach {
        container_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

/// JSON text frames to the client. Terminal output travels as binary.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Attached { container_id: &'a str },
    Error { message: &'a str },
    Exited { code: Option<i32>, message: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Attach {
        container_id: String,
        cols: u16,
        rows: u16,
    },
    Input(Bytes),
    Resize {
        cols: u16,
        rows: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Attached { container_id: String },
    Output(Bytes),
    Error { message: String },
    Exited { code: Option<i32>, message: String },
}

impl ClientMessage {
    fn from_ws(msg: Message) -> Option<Result<Self, String>> {
        match msg {
            Message::Binary(data) => Some(Ok(Self::Input(data))),
            Message::Text(text) => Some(
                serde_json::from_str::<ClientFrame>(text.as_str())
                    .map(Self::from)
                    .map_err(|e| format!("invalid message: {e}")),
            ),
            _ => None,
        }
    }
}

impl From<ClientFrame> for ClientMessage {
    fn from(frame: ClientFrame) -> Self {
        match frame {
            ClientFrame::Attach {
                container_id,
                cols,
                rows,
            } => Self::Attach {
                container_id,
                cols: cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
                rows: rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
            },
            ClientFrame::Input { data } => Self::Input(Bytes::from(data)),
            ClientFrame::Resize { cols, rows } => Self::Resize { cols, rows },
        }
    }
}

impl ServerMessage {
    fn into_ws(self) -> Message {
        let text = match &self {
            ServerMessage::Output(data) => return Message::Binary(data.clone()),
            ServerMessage::Attached { container_id } => {
                serde_json::to_string(&ServerFrame::Attached { container_id })
            }
            ServerMessage::Error { message } => serde_json::to_string(&ServerFrame::Error { message }),
            ServerMessage::Exited { code, message } => serde_json::to_string(&ServerFrame::Exited {
                code: *code,
                message,
            }),
        };
        // Serializing these flat frames cannot fail.
        Message::Text(text.unwrap_or_default().into())
    }
}

pub fn exit_notice(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("[Session terminated: exit code {code}]"),
        None => "[Session terminated]".to_string(),
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct Attached {
    container_id: String,
    process: ShellProcess,
    events: mpsc::Receiver<ShellEvent>,
}

/// Per-connection state. Holds at most one shell.
pub struct TerminalSession {
    store: Arc<dyn VpsStore>,
    backend: Arc<dyn ContainerBackend>,
    caller: Caller,
    outgoing: mpsc::Sender<ServerMessage>,
    current: Option<Attached>,
}

impl TerminalSession {
    pub fn new(
        store: Arc<dyn VpsStore>,
        backend: Arc<dyn ContainerBackend>,
        caller: Caller,
        outgoing: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            store,
            backend,
            caller,
            outgoing,
            current: None,
        }
    }

    /// Drive the session until the client goes away. On return no shell
    /// started by this session is left running.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<ClientMessage>) {
        loop {
            tokio::select! {
                msg = incoming.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                event = next_event(&mut self.current) => self.relay(event).await,
            }
        }

        if let Some(attached) = self.current.take() {
            info!(
                user_id = self.caller.user_id,
                container_id = %attached.container_id,
                "terminal: client disconnected, killing shell"
            );
            attached.process.terminate().await;
        }
    }

    async fn send(&self, msg: ServerMessage) {
        // A closed channel means the client is gone; the loop ends on the
        // incoming side.
        let _ = self.outgoing.send(msg).await;
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Attach {
                container_id,
                cols,
                rows,
            } => self.attach(container_id, cols, rows).await,
            ClientMessage::Input(data) => {
                if let Some(attached) = &self.current
                    && let Err(e) = attached.process.write(data)
                {
                    warn!(container_id = %attached.container_id, error = %e, "terminal: input dropped");
                }
            }
            ClientMessage::Resize { cols, rows } => {
                if let Some(attached) = &self.current
                    && let Err(e) = attached.process.resize(cols, rows)
                {
                    debug!(container_id = %attached.container_id, error = %e, "terminal: resize failed");
                }
            }
        }
    }

    async fn attach(&mut self, container_id: String, cols: u16, rows: u16) {
        let vps = match self.store.find_by_container_id(&container_id).await {
            Ok(Some(vps)) if self.caller.can_access(&vps) => vps,
            Ok(_) => {
                warn!(
                    user_id = self.caller.user_id,
                    %container_id,
                    "terminal: attach to unknown or foreign container rejected"
                );
                self.send(ServerMessage::Error {
                    message: format!("{SECURITY_ERROR_PREFIX} unknown container {container_id}"),
                })
                .await;
                return;
            }
            Err(e) => {
                warn!(%container_id, error = %e, "terminal: record lookup failed");
                self.send(ServerMessage::Error {
                    message: "could not verify container".into(),
                })
                .await;
                return;
            }
        };

        if let Some(previous) = self.current.take() {
            debug!(container_id = %previous.container_id, "terminal: replacing previous shell");
            previous.process.terminate().await;
        }

        let shell = self
            .backend
            .shell_command(&ContainerId(vps.container_id.clone()));
        match ShellProcess::spawn(&shell, cols, rows) {
            Ok((process, events)) => {
                info!(
                    user_id = self.caller.user_id,
                    container_id = %vps.container_id,
                    pid = ?process.pid(),
                    "terminal: shell attached"
                );
                self.current = Some(Attached {
                    container_id: vps.container_id.clone(),
                    process,
                    events,
                });
                self.send(ServerMessage::Attached {
                    container_id: vps.container_id,
                })
                .await;
            }
            Err(e) => {
                warn!(container_id = %vps.container_id, error = %e, "terminal: spawn failed");
                self.send(ServerMessage::Error {
                    message: format!("failed to start shell: {e}"),
                })
                .await;
            }
        }
    }

    async fn relay(&mut self, event: ShellEvent) {
        match event {
            ShellEvent::Output(data) => self.send(ServerMessage::Output(data)).await,
            ShellEvent::Exited(code) => {
                if let Some(attached) = self.current.take() {
                    info!(container_id = %attached.container_id, ?code, "terminal: shell exited");
                }
                self.send(ServerMessage::Exited {
                    code,
                    message: exit_notice(code),
                })
                .await;
            }
        }
    }
}

/// Next event of the attached shell; pending while nothing is attached.
async fn next_event(current: &mut Option<Attached>) -> ShellEvent {
    match current {
        // A closed channel without an exit event means the supervisor is
        // gone; report it as an exit so the handle is cleared.
        Some(attached) => attached.events.recv().await.unwrap_or(ShellEvent::Exited(None)),
        None => std::future::pending().await,
    }
}

// ── WebSocket adapter ───────────────────────────────────────────────

pub fn terminal_router() -> Router<AppState> {
    Router::new().route("/terminal/ws", get(terminal_ws))
}

async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let caller = authenticate_terminal_request(
        &headers,
        query.get("token").map(String::as_str),
        &state.config.jwt_secret,
    )
    .ok_or(ApiError::Unauthorized)?;

    Ok(ws.on_upgrade(move |socket| ws_session(socket, state, caller)))
}

/// Bridge a WebSocket to a [`TerminalSession`].
pub async fn ws_session(socket: WebSocket, state: AppState, caller: Caller) {
    let (mut ws_write, mut ws_read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);
    let (in_tx, in_rx) = mpsc::channel::<ClientMessage>(64);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_write.send(msg.into_ws()).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let errors = out_tx.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_read.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            match ClientMessage::from_ws(msg) {
                Some(Ok(msg)) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(message)) => {
                    let _ = errors.send(ServerMessage::Error { message }).await;
                }
                None => {}
            }
        }
        // Dropping `in_tx` ends the session.
    });

    info!(user_id = caller.user_id, "terminal: connection opened");
    TerminalSession::new(state.store.clone(), state.backend.clone(), caller, out_tx)
        .run(in_rx)
        .await;

    read_task.abort();
    let _ = write_task.await;
    info!(user_id = caller.user_id, "terminal: connection closed");
}
