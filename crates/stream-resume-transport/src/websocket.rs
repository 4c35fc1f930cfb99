//! WebSocket transport.
//!
//! Each socket binds to one stream, either freshly opened or resumed from a
//! last-seen event id, and receives that stream's events until it closes.
//! Closing the socket leaves the stream in place so a later connection can
//! resume it.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::BoxStream};
use serde_json::Value;
use stream_resume_core::{Event, StreamId};
use stream_resume_session::StreamSessionManager;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    /// Shared stream sessions.
    pub sessions: Arc<StreamSessionManager<Value>>,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(sessions: Arc<StreamSessionManager<Value>>) -> Self {
        Self { sessions }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Forward stream events to the outbound channel.
fn spawn_forwarder(
    mut events: BoxStream<'static, Event<Value>>,
    tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if tx.send(ServerMessage::event(&event)).is_err() {
                break;
            }
        }
    })
}

/// Connection-local binding to a stream.
#[derive(Default)]
struct Binding {
    stream_id: Option<StreamId>,
    forwarder: Option<JoinHandle<()>>,
}

impl Binding {
    fn bind(&mut self, stream_id: StreamId, forwarder: JoinHandle<()>) {
        if let Some(previous) = self.forwarder.replace(forwarder) {
            previous.abort();
        }
        self.stream_id = Some(stream_id);
    }

    fn release(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Apply one client message to the connection's binding.
async fn handle_client_message(
    state: &WsState,
    msg: ClientMessage,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    binding: &mut Binding,
) {
    match msg {
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
        ClientMessage::Open => {
            let stream_id = state.sessions.open_stream();
            let live = state.sessions.subscribe(&stream_id);
            let _ = tx.send(ServerMessage::StreamOpened {
                stream_id: stream_id.clone(),
            });
            binding.bind(stream_id, spawn_forwarder(live, tx.clone()));
        }
        ClientMessage::Resume { last_event_id } => match state.sessions.resume(last_event_id).await {
            Ok(resumed) => {
                let stream_id = resumed.stream_id().clone();
                // Announce first; replayed events follow on the same channel.
                let _ = tx.send(ServerMessage::StreamResumed {
                    stream_id: stream_id.clone(),
                    replayed: resumed.replayed().len(),
                });
                let forwarder = spawn_forwarder(resumed.into_stream(), tx.clone());
                binding.bind(stream_id, forwarder);
            }
            Err(e) => {
                tracing::info!("Resume of {last_event_id} failed: {e}");
                let _ = tx.send(ServerMessage::ResumeFailed { last_event_id });
            }
        },
        ClientMessage::Publish { payload } => match &binding.stream_id {
            Some(stream_id) => {
                state.sessions.publish(stream_id, payload);
            }
            None => {
                let _ = tx.send(ServerMessage::Error {
                    message: "No stream bound; send open or resume first".to_string(),
                });
            }
        },
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut binding = Binding::default();

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                continue;
            }
        };

        handle_client_message(&state, client_msg, &tx, &mut binding).await;
    }

    binding.release();
    send_task.abort();
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(sessions));
/// ```
#[must_use]
pub fn create_ws_router(sessions: Arc<StreamSessionManager<Value>>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(sessions))
}
