//! Server-sent events transport.
//!
//! Every SSE frame carries the event id in its `id:` field, so browsers
//! and other SSE clients resume automatically by sending `Last-Event-ID`
//! when they reconnect.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stream_resume_core::{Event, EventId, StreamId};
use stream_resume_session::StreamSessionManager;
use thiserror::Error;

/// Header a reconnecting SSE client uses to cite its last-seen event.
pub const LAST_EVENT_ID: &str = "last-event-id";

/// SSE handler state.
#[derive(Clone)]
pub struct SseState {
    /// Shared stream sessions.
    pub sessions: Arc<StreamSessionManager<Value>>,
}

/// SSE transport error.
#[derive(Debug, Error)]
pub enum SseError {
    #[error("Invalid Last-Event-ID: {0}")]
    InvalidEventId(String),
    #[error("Event {event_id} not found on stream {stream_id}")]
    NotFound {
        stream_id: StreamId,
        event_id: EventId,
    },
}

impl IntoResponse for SseError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::InvalidEventId(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Response for `POST /streams`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamOpened {
    pub stream_id: StreamId,
}

/// Response for `POST /streams/{stream_id}/messages`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Published {
    pub event_id: EventId,
}

fn to_sse(event: &Event<Value>) -> SseEvent {
    SseEvent::default()
        .id(event.event_id().to_string())
        .event("message")
        .data(serde_json::to_string(event.payload()).unwrap_or_default())
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<EventId>, SseError> {
    let Some(raw) = headers.get(LAST_EVENT_ID) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| SseError::InvalidEventId("<non-ascii>".to_string()))?;
    raw.parse()
        .map(Some)
        .map_err(|_| SseError::InvalidEventId(raw.to_string()))
}

/// POST /streams - open a new stream
async fn open_stream(State(state): State<SseState>) -> Json<StreamOpened> {
    let stream_id = state.sessions.open_stream();
    Json(StreamOpened { stream_id })
}

/// POST /streams/{stream_id}/messages - publish a message
async fn publish(
    State(state): State<SseState>,
    Path(stream_id): Path<String>,
    Json(payload): Json<Value>,
) -> Json<Published> {
    let event_id = state.sessions.publish(&StreamId::from(stream_id), payload);
    Json(Published { event_id })
}

/// DELETE /streams/{stream_id} - close a stream
async fn close_stream(
    State(state): State<SseState>,
    Path(stream_id): Path<String>,
) -> StatusCode {
    state.sessions.close_stream(&StreamId::from(stream_id));
    StatusCode::NO_CONTENT
}

/// GET /streams/{stream_id}/events - live events, resuming after `Last-Event-ID`
async fn events(
    State(state): State<SseState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, SseError> {
    let stream_id = StreamId::from(stream_id);

    let events = match last_event_id(&headers)? {
        Some(event_id) => {
            let not_found = || SseError::NotFound {
                stream_id: stream_id.clone(),
                event_id,
            };
            let resumed = state
                .sessions
                .resume(event_id)
                .await
                .map_err(|_| not_found())?;
            if resumed.stream_id() != &stream_id {
                return Err(not_found());
            }
            resumed.into_stream()
        }
        None => state.sessions.subscribe(&stream_id),
    };

    let stream = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(30))))
}

/// Create SSE router.
#[must_use]
pub fn create_sse_router(sessions: Arc<StreamSessionManager<Value>>) -> Router {
    Router::new()
        .route("/streams", post(open_stream))
        .route("/streams/{stream_id}", axum::routing::delete(close_stream))
        .route("/streams/{stream_id}/messages", post(publish))
        .route("/streams/{stream_id}/events", get(events))
        .with_state(SseState { sessions })
}
