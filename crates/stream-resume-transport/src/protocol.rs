//! Wire protocol for client-server communication.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stream_resume_core::{Event, EventId, StreamId};

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a fresh stream and bind the connection to it.
    Open,
    /// Resume the stream `last_event_id` belongs to.
    Resume { last_event_id: EventId },
    /// Publish a message on the bound stream.
    Publish { payload: Value },
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A new stream was opened.
    StreamOpened { stream_id: StreamId },
    /// A stream was resumed; `replayed` missed events follow.
    StreamResumed { stream_id: StreamId, replayed: usize },
    /// One stream event.
    Event {
        event_id: EventId,
        stream_id: StreamId,
        payload: Value,
    },
    /// The anchor is unknown or evicted; open a fresh stream.
    ResumeFailed { last_event_id: EventId },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Wire form of a stream event.
    #[must_use]
    pub fn event(event: &Event<Value>) -> Self {
        Self::Event {
            event_id: event.event_id(),
            stream_id: event.stream_id().clone(),
            payload: event.payload().clone(),
        }
    }
}
