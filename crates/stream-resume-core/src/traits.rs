//! Core traits for event storage and replay delivery.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Event, EventId, StreamId};

/// Error raised by an [`EventSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,
    #[error("Sink error: {0}")]
    Failed(String),
}

/// Replay error.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The anchor was never issued or has since been evicted.
    ///
    /// The gap cannot be bridged; the caller should start a fresh stream.
    #[error("Event not found: {0}")]
    NotFound(EventId),
    /// The sink rejected an event part-way through the replay.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] SinkError),
}

impl ReplayError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Receiver of replayed events.
#[async_trait]
pub trait EventSink<M>: Send {
    /// Deliver one event.
    async fn send(&mut self, event: Event<M>) -> Result<(), SinkError>;
}

#[async_trait]
impl<M: Send + Sync> EventSink<M> for mpsc::Sender<Event<M>> {
    async fn send(&mut self, event: Event<M>) -> Result<(), SinkError> {
        Self::send(self, event).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl<M: Send + Sync> EventSink<M> for mpsc::UnboundedSender<Event<M>> {
    async fn send(&mut self, event: Event<M>) -> Result<(), SinkError> {
        Self::send(self, event).map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl<M: Send + Sync> EventSink<M> for Vec<Event<M>> {
    async fn send(&mut self, event: Event<M>) -> Result<(), SinkError> {
        self.push(event);
        Ok(())
    }
}

/// Trait for resumable event storage backends.
#[async_trait]
pub trait EventStore<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    /// Store a message on a stream, returning its new event id.
    async fn store_event(&self, stream_id: StreamId, message: M) -> EventId;

    /// Replay every event stored after `last_event_id` on its stream.
    ///
    /// Returns the stream the anchor belongs to.
    async fn replay_events_after(
        &self,
        last_event_id: EventId,
        sink: &mut dyn EventSink<M>,
    ) -> Result<StreamId, ReplayError>;

    /// Forget a stream and all of its events.
    async fn drop_stream(&self, stream_id: &StreamId) -> usize;
}
