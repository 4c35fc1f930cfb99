//! Event and stream identifiers, and the immutable event record.

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque event identifier.
///
/// Backed by a random 128-bit UUID, so ids stay unique across streams and
/// process restarts. Consumers must not parse ids or assume any ordering
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identifier of a logical stream (one per long-lived session).
///
/// Chosen by the caller; any string works and the log never rejects one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random stream id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<&StreamId> for StreamId {
    fn from(id: &StreamId) -> Self {
        id.clone()
    }
}

/// One message placed on one stream.
///
/// The payload is shared, so cloning an event (for replay snapshots or
/// fan-out to live subscribers) never copies the message itself.
#[derive(Debug)]
pub struct Event<M> {
    event_id: EventId,
    stream_id: StreamId,
    payload: Arc<M>,
}

impl<M> Event<M> {
    pub(crate) fn new(event_id: EventId, stream_id: StreamId, payload: M) -> Self {
        Self {
            event_id,
            stream_id,
            payload: Arc::new(payload),
        }
    }

    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    #[must_use]
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Shared handle to the payload.
    #[must_use]
    pub fn shared_payload(&self) -> Arc<M> {
        Arc::clone(&self.payload)
    }
}

impl<M> Clone for Event<M> {
    fn clone(&self) -> Self {
        Self {
            event_id: self.event_id,
            stream_id: self.stream_id.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_id_parse_display() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<EventId>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let stream = StreamId::new("session-1");
        assert_eq!(serde_json::to_string(&stream).unwrap(), "\"session-1\"");

        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_event_clone_shares_payload() {
        let event = Event::new(EventId::new(), StreamId::from("s"), vec![1u8, 2, 3]);
        let copy = event.clone();
        assert!(Arc::ptr_eq(&event.shared_payload(), &copy.shared_payload()));
        assert_eq!(copy.payload(), &vec![1, 2, 3]);
    }
}
