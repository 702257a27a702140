//! WebSocket handler for real-time voice chat
//!
//! A socket is bound to the session named by its client id. Turns run the
//! same producer as the poll endpoints; a push reader drains the session
//! queue on every change and forwards chunks as they land.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ApiState;
use crate::session::{AudioChunk, RunPhase, Session};

const fn default_use_rag() -> bool {
    true
}

/// Incoming WebSocket message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Start a turn from text
    TextInput {
        text: String,
        #[serde(default = "default_use_rag")]
        use_rag: bool,
    },
    /// Cancel, forget history and delete artifacts
    ClearSession,
    /// Stop the current run
    Stop,
    /// Ping to keep connection alive
    Ping,
}

/// Outgoing WebSocket message to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Connection established
    Connected { session_id: String },
    /// Turn or session status change
    Status { status: &'static str },
    /// Transcript of an audio frame
    Transcription { text: String },
    /// Full response text, sent when a turn finishes
    TextResponse { text: String, processing_time: f64 },
    /// One synthesized sentence
    AudioResponseChunk {
        text: String,
        /// Base64 WAV
        audio: String,
        format: &'static str,
        chunk_index: usize,
        end: bool,
    },
    /// Error occurred
    Error { message: String },
    /// Pong response
    Pong,
}

impl From<AudioChunk> for WsOutgoing {
    fn from(chunk: AudioChunk) -> Self {
        Self::AudioResponseChunk {
            text: chunk.text,
            audio: BASE64.encode(&chunk.wav),
            format: "wav",
            chunk_index: chunk.index,
            end: chunk.end,
        }
    }
}

impl WsOutgoing {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Build WebSocket router (nested under `/ws`)
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{client_id}", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, client_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let connected = WsOutgoing::Connected {
        session_id: client_id.clone(),
    };
    if let Ok(msg) = serde_json::to_string(&connected) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    tracing::info!(session_id = %client_id, "WebSocket connected");

    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(64);
    let (turns_tx, turns_rx) = mpsc::channel::<Turn>(8);

    // Forward outgoing messages to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let connection = Connection {
        state,
        key: client_id.clone(),
        tx: tx.clone(),
        turns: turns_tx,
    };
    let push_task = tokio::spawn(push_reader(connection.session(), tx, turns_rx));

    let session_id = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => connection.handle_text(&text).await,
                Message::Binary(data) => connection.handle_audio(data.to_vec()).await,
                Message::Ping(data) => {
                    connection.session();
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(session_id = %session_id, "WebSocket closed by client");
                    break;
                }
                Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    // A run in progress keeps going; its chunks stay queued for polling
    push_task.abort();

    tracing::info!(session_id = %client_id, "WebSocket disconnected");
}

/// A turn begun on this socket, handed to the push reader
struct Turn {
    started: Instant,
    session: Arc<Session>,
}

/// Per-socket request handling
///
/// The socket is bound to a session key, not a session: every frame looks
/// the key up again, so a session that expired between frames is replaced
/// instead of being used detached from the store.
struct Connection {
    state: Arc<ApiState>,
    key: String,
    tx: mpsc::Sender<WsOutgoing>,
    turns: mpsc::Sender<Turn>,
}

impl Connection {
    /// The live session for this socket's key, marked active
    fn session(&self) -> Arc<Session> {
        let session = self.state.sessions().get_or_create(&self.key);
        session.touch();
        session
    }

    async fn send(&self, msg: WsOutgoing) {
        // The send task is gone only when the socket is closing
        let _ = self.tx.send(msg).await;
    }

    async fn handle_text(&self, text: &str) {
        let session = self.session();
        let incoming: WsIncoming = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.send(WsOutgoing::error(format!("invalid message: {e}"))).await;
                return;
            }
        };

        match incoming {
            WsIncoming::Ping => self.send(WsOutgoing::Pong).await,
            WsIncoming::TextInput { text, use_rag } => {
                let text = text.trim();
                if text.is_empty() {
                    self.send(WsOutgoing::error("Missing text content")).await;
                    return;
                }
                self.start_turn(session, Instant::now(), text, use_rag, None)
                    .await;
            }
            WsIncoming::Stop => {
                session.cancel();
                self.send(WsOutgoing::Status { status: "stopped" }).await;
            }
            WsIncoming::ClearSession => match self.state.sessions().clear(&self.key) {
                Ok(()) => {
                    self.send(WsOutgoing::Status {
                        status: "session_cleared",
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.key, error = %e, "failed to clear session");
                    self.send(WsOutgoing::error(e.to_string())).await;
                }
            },
        }
    }

    async fn handle_audio(&self, audio: Vec<u8>) {
        let started = Instant::now();
        let session = self.session();
        if audio.is_empty() {
            self.send(WsOutgoing::error("empty audio data")).await;
            return;
        }

        let key = session.key();
        let input_path = match self
            .state
            .sessions()
            .artifacts()
            .save_input(key, "wav", &audio)
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(session_id = %key, error = %e, "failed to save input audio");
                None
            }
        };

        self.send(WsOutgoing::Status {
            status: "processing",
        })
        .await;

        match self.state.pipeline.transcribe(audio, "audio.wav").await {
            Ok(text) => {
                self.send(WsOutgoing::Transcription { text: text.clone() }).await;
                // Transcription can be slow; look the key up again
                self.start_turn(self.session(), started, &text, true, input_path)
                    .await;
            }
            Err(e) => {
                tracing::warn!(session_id = %key, error = %e, "transcription failed");
                self.send(WsOutgoing::error(e.to_string())).await;
            }
        }
    }

    async fn start_turn(
        &self,
        session: Arc<Session>,
        started: Instant,
        text: &str,
        use_rag: bool,
        audio_path: Option<std::path::PathBuf>,
    ) {
        match self
            .state
            .pipeline
            .start_stream(Arc::clone(&session), text, use_rag, audio_path)
        {
            Ok(_) => {
                self.send(WsOutgoing::Status {
                    status: "processing",
                })
                .await;
                let _ = self.turns.send(Turn { started, session }).await;
            }
            Err(e) => self.send(WsOutgoing::error(e.to_string())).await,
        }
    }
}

/// Drain the session on every change and push what landed
///
/// `turns` carries each turn begun on this socket. The reader follows the
/// turn's session, which differs from the current one only when the key
/// was recreated after expiry. Once the session stops processing, the turn
/// is closed with its full text and final status.
async fn push_reader(
    mut session: Arc<Session>,
    tx: mpsc::Sender<WsOutgoing>,
    mut turns: mpsc::Receiver<Turn>,
) {
    let mut changes = session.subscribe();
    let mut turn: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            next = turns.recv() => match next {
                Some(next) => {
                    if !Arc::ptr_eq(&next.session, &session) {
                        session = next.session;
                        changes = session.subscribe();
                    }
                    turn = Some(next.started);
                }
                None => break,
            },
        }
        changes.mark_unchanged();

        let drain = session.drain();
        for chunk in drain.chunks {
            if tx.send(WsOutgoing::from(chunk)).await.is_err() {
                return;
            }
        }
        for error in drain.errors {
            if tx.send(WsOutgoing::error(error)).await.is_err() {
                return;
            }
        }

        if drain.is_processing {
            continue;
        }
        let Some(started) = turn.take() else {
            continue;
        };

        let status = match session.phase() {
            RunPhase::Completed => "complete",
            RunPhase::Cancelled => "cancelled",
            // Reset under us; the clear handler reports it
            RunPhase::Idle | RunPhase::Processing => continue,
        };

        let closing = [
            WsOutgoing::TextResponse {
                text: drain.response_so_far,
                processing_time: started.elapsed().as_secs_f64(),
            },
            WsOutgoing::Status { status },
        ];
        for msg in closing {
            if tx.send(msg).await.is_err() {
                return;
            }
        }
    }
}
