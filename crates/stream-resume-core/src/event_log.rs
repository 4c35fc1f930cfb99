//! Bounded per-stream event log with resumable replay.
//!
//! Every stream owns a ring of at most `max_events_per_stream` events. A
//! global index maps each buffered event id to its stream and insertion
//! sequence, so a resumption anchor resolves without scanning streams.
//! Buffers and index live behind one lock and are always updated together.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    Event, EventId, EventLogConfig, StreamId,
    config::ConfigError,
    traits::{EventSink, EventStore, ReplayError},
};

/// Initial allocation for a new stream buffer.
const INITIAL_STREAM_ALLOC: usize = 32;

/// Point-in-time counts for a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventLogStats {
    /// Streams with a live buffer.
    pub streams: usize,
    /// Events currently buffered across all streams.
    pub events: usize,
}

/// Locator stored in the global index.
struct IndexEntry {
    stream_id: StreamId,
    seq: u64,
}

struct StreamBuffer<M> {
    events: VecDeque<Event<M>>,
    /// Sequence number of the front event.
    head_seq: u64,
}

impl<M> StreamBuffer<M> {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(INITIAL_STREAM_ALLOC)),
            head_seq: 0,
        }
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn pop_front(&mut self) -> Option<Event<M>> {
        let evicted = self.events.pop_front()?;
        self.head_seq += 1;
        Some(evicted)
    }

    /// Push at the tail, returning the event's sequence number.
    fn push_back(&mut self, event: Event<M>) -> u64 {
        let seq = self.head_seq + self.events.len() as u64;
        self.events.push_back(event);
        seq
    }

    fn position(&self, seq: u64) -> Option<usize> {
        let offset = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        (offset < self.events.len()).then_some(offset)
    }
}

struct Inner<M> {
    streams: HashMap<StreamId, StreamBuffer<M>>,
    index: HashMap<EventId, IndexEntry>,
}

/// In-memory resumable event log.
///
/// Construct one per server and share it by `Arc`; all operations take
/// `&self` and are safe to call concurrently from any number of sessions.
pub struct EventLog<M> {
    capacity: usize,
    inner: Mutex<Inner<M>>,
}

impl<M> Default for EventLog<M> {
    fn default() -> Self {
        Self::with_validated(EventLogConfig::default())
    }
}

impl<M> EventLog<M> {
    /// Create a log from a configuration.
    ///
    /// # Errors
    /// Returns error if the configured capacity is zero.
    pub fn new(config: EventLogConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_validated(config))
    }

    /// Create a log holding at most `max_events_per_stream` events per stream.
    ///
    /// # Errors
    /// Returns error if `max_events_per_stream` is zero.
    pub fn with_capacity(max_events_per_stream: usize) -> Result<Self, ConfigError> {
        Self::new(EventLogConfig::new(max_events_per_stream)?)
    }

    fn with_validated(config: EventLogConfig) -> Self {
        info!(
            max_events_per_stream = config.max_events_per_stream,
            "Event log initialized"
        );
        Self {
            capacity: config.max_events_per_stream,
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Per-stream capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message to a stream.
    ///
    /// Creates the stream on first use. When the stream is full its oldest
    /// event is evicted from both the buffer and the index before the new
    /// one is inserted.
    pub fn append(&self, stream_id: impl Into<StreamId>, payload: M) -> EventId {
        self.append_event(stream_id, payload).event_id()
    }

    /// Like [`append`](Self::append), but returns the stored event.
    ///
    /// Used by callers that fan the event out to live subscribers.
    pub fn append_event(&self, stream_id: impl Into<StreamId>, payload: M) -> Event<M> {
        let stream_id = stream_id.into();
        let event_id = EventId::new();
        let event = Event::new(event_id, stream_id.clone(), payload);
        let stored = event.clone();

        let mut inner = self.inner.lock();
        let Inner { streams, index } = &mut *inner;

        let buffer = streams
            .entry(stream_id.clone())
            .or_insert_with(|| StreamBuffer::new(self.capacity));

        if buffer.len() >= self.capacity {
            if let Some(evicted) = buffer.pop_front() {
                index.remove(&evicted.event_id());
                trace!(
                    stream_id = %stream_id,
                    event_id = %evicted.event_id(),
                    "Evicted oldest event"
                );
            }
        }

        let seq = buffer.push_back(stored);
        index.insert(event_id, IndexEntry { stream_id, seq });
        event
    }

    /// Replay the events stored after `last_event_id`, in append order.
    ///
    /// The anchor itself is never delivered. If it is the newest event on
    /// its stream, `deliver` is not called and the stream id is still
    /// returned. Delivery runs on a snapshot taken under the lock, so
    /// `deliver` may freely call back into the log.
    ///
    /// # Errors
    /// Returns [`ReplayError::NotFound`] if the anchor was never issued or
    /// has been evicted.
    pub fn replay_after<F>(
        &self,
        last_event_id: &EventId,
        mut deliver: F,
    ) -> Result<StreamId, ReplayError>
    where
        F: FnMut(Event<M>),
    {
        let (stream_id, pending) = self.snapshot_after(last_event_id)?;
        let replayed = pending.len();
        for event in pending {
            deliver(event);
        }
        debug!(stream_id = %stream_id, replayed, "Replayed events");
        Ok(stream_id)
    }

    /// Events strictly after the anchor, cloned under the lock.
    fn snapshot_after(
        &self,
        last_event_id: &EventId,
    ) -> Result<(StreamId, Vec<Event<M>>), ReplayError> {
        let inner = self.inner.lock();

        let located = inner.index.get(last_event_id).and_then(|entry| {
            let buffer = inner.streams.get(&entry.stream_id)?;
            let position = buffer.position(entry.seq)?;
            Some((&entry.stream_id, buffer, position))
        });

        let Some((stream_id, buffer, position)) = located else {
            warn!(event_id = %last_event_id, "Event not found for replay");
            return Err(ReplayError::NotFound(*last_event_id));
        };

        let pending = buffer.events.range(position + 1..).cloned().collect();
        Ok((stream_id.clone(), pending))
    }

    /// Remove a stream and all its events from buffer and index.
    ///
    /// Returns the number of events dropped.
    pub fn drop_stream(&self, stream_id: &StreamId) -> usize {
        let mut inner = self.inner.lock();
        let Inner { streams, index } = &mut *inner;

        let Some(buffer) = streams.remove(stream_id) else {
            return 0;
        };
        for event in &buffer.events {
            index.remove(&event.event_id());
        }
        debug!(stream_id = %stream_id, dropped = buffer.len(), "Dropped stream");
        buffer.len()
    }

    /// Number of events currently buffered for a stream.
    #[must_use]
    pub fn stream_len(&self, stream_id: &StreamId) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream_id)
            .map_or(0, StreamBuffer::len)
    }

    /// Newest buffered event on a stream.
    #[must_use]
    pub fn latest(&self, stream_id: &StreamId) -> Option<EventId> {
        self.inner
            .lock()
            .streams
            .get(stream_id)?
            .events
            .back()
            .map(Event::event_id)
    }

    /// Deliver every buffered event of a stream, oldest first.
    ///
    /// Like [`replay_after`](Self::replay_after), the events are copied under
    /// the lock and delivered after it is released. Returns how many were
    /// delivered; an unknown stream delivers nothing.
    pub fn replay_stream<F>(&self, stream_id: &StreamId, mut deliver: F) -> usize
    where
        F: FnMut(Event<M>),
    {
        let pending: Vec<Event<M>> = self
            .inner
            .lock()
            .streams
            .get(stream_id)
            .map(|buffer| buffer.events.iter().cloned().collect())
            .unwrap_or_default();
        let delivered = pending.len();
        for event in pending {
            deliver(event);
        }
        delivered
    }

    /// Stream an event belongs to, if it is still buffered.
    #[must_use]
    pub fn stream_of(&self, event_id: &EventId) -> Option<StreamId> {
        self.inner
            .lock()
            .index
            .get(event_id)
            .map(|entry| entry.stream_id.clone())
    }

    /// Whether an event id can still anchor a replay.
    #[must_use]
    pub fn contains(&self, event_id: &EventId) -> bool {
        self.inner.lock().index.contains_key(event_id)
    }

    #[must_use]
    pub fn stats(&self) -> EventLogStats {
        let inner = self.inner.lock();
        EventLogStats {
            streams: inner.streams.len(),
            events: inner.index.len(),
        }
    }
}

#[async_trait]
impl<M> EventStore<M> for EventLog<M>
where
    M: Send + Sync + 'static,
{
    async fn store_event(&self, stream_id: StreamId, message: M) -> EventId {
        self.append(stream_id, message)
    }

    async fn replay_events_after(
        &self,
        last_event_id: EventId,
        sink: &mut dyn EventSink<M>,
    ) -> Result<StreamId, ReplayError> {
        let (stream_id, pending) = self.snapshot_after(&last_event_id)?;
        let replayed = pending.len();
        for event in pending {
            sink.send(event).await?;
        }
        debug!(stream_id = %stream_id, replayed, "Replayed events");
        Ok(stream_id)
    }

    async fn drop_stream(&self, stream_id: &StreamId) -> usize {
        Self::drop_stream(self, stream_id)
    }
}
