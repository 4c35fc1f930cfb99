//! Stream session manager for opening, resuming and fanning out streams.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Weak},
};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use stream_resume_core::{Event, EventId, EventLog, EventStore, ReplayError, StreamId};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, trace, warn};

/// Live fan-out capacity per stream.
pub const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),
}

impl SessionError {
    /// Whether resumption failed because the anchor is unknown or evicted.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Replay(e) => e.is_not_found(),
        }
    }
}

type LiveSender<M> = Arc<broadcast::Sender<Event<M>>>;
type Channels<M> = HashMap<StreamId, LiveSender<M>>;

/// A live receiver on one stream's channel.
///
/// Dropping the last subscription of a stream removes its channel.
struct Subscription<M> {
    receiver: Option<broadcast::Receiver<Event<M>>>,
    stream_id: StreamId,
    channel: Weak<broadcast::Sender<Event<M>>>,
    channels: Arc<Mutex<Channels<M>>>,
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        drop(self.receiver.take());
        let mut channels = self.channels.lock();
        let idle = channels.get(&self.stream_id).is_some_and(|sender| {
            std::ptr::eq(Arc::as_ptr(sender), self.channel.as_ptr()) && sender.receiver_count() == 0
        });
        if idle {
            channels.remove(&self.stream_id);
            trace!(stream_id = %self.stream_id, "Removed idle live channel");
        }
    }
}

/// Live position of one subscriber.
///
/// When the broadcast channel overruns, the missed events are read back
/// from the log after the last event handed out. If the log no longer
/// holds that event the gap cannot be bridged and the stream ends, so the
/// client reconnects and resumes (or learns it must start over).
struct LiveCursor<M> {
    log: Arc<EventLog<M>>,
    subscription: Subscription<M>,
    /// Last event handed out, or the stream tail when subscribing.
    last: Option<EventId>,
    /// Events handed out that may still arrive on the channel.
    seen: HashSet<EventId>,
    pending: VecDeque<Event<M>>,
}

impl<M> LiveCursor<M>
where
    M: Send + Sync + 'static,
{
    fn new(log: Arc<EventLog<M>>, subscription: Subscription<M>, last: Option<EventId>) -> Self {
        Self {
            log,
            subscription,
            last,
            seen: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    fn with_history(mut self, history: Vec<Event<M>>) -> Self {
        self.seen.extend(history.iter().map(Event::event_id));
        self.pending.extend(history);
        self
    }

    async fn next_event(&mut self) -> Option<Event<M>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.last = Some(event.event_id());
                return Some(event);
            }
            let receiver = self.subscription.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    if self.seen.remove(&event.event_id()) {
                        continue;
                    }
                    // Channel order is log order: everything seen is older.
                    self.seen.clear();
                    self.last = Some(event.event_id());
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    if !self.refill(skipped) {
                        return None;
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Queue the events after `last` from the log. Returns false if the
    /// log has evicted part of the gap.
    fn refill(&mut self, skipped: u64) -> bool {
        let stream_id = &self.subscription.stream_id;
        let mut missed = Vec::new();
        let bridged = match self.last {
            Some(anchor) => self.log.replay_after(&anchor, |event| missed.push(event)).is_ok(),
            // Subscribed to an empty stream: the whole buffer is new, unless
            // it has filled up and started evicting.
            None => {
                self.log.replay_stream(stream_id, |event| missed.push(event));
                missed.len() < self.log.capacity()
            }
        };
        if !bridged {
            warn!(stream_id = %stream_id, skipped, "Live subscriber lagged past the log; ending stream");
            return false;
        }
        debug!(stream_id = %stream_id, skipped, recovered = missed.len(), "Live subscriber lagged; refilled from log");
        self.seen.extend(missed.iter().map(Event::event_id));
        self.pending.extend(missed);
        true
    }

    fn into_stream(self) -> BoxStream<'static, Event<M>> {
        futures::stream::unfold(self, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })
        .boxed()
    }
}

/// A resumed stream: the events missed while disconnected, then live updates.
pub struct Resumed<M> {
    stream_id: StreamId,
    replayed: Vec<Event<M>>,
    cursor: LiveCursor<M>,
}

impl<M> Resumed<M>
where
    M: Send + Sync + 'static,
{
    /// Stream the anchor belongs to.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Events appended after the anchor, oldest first.
    #[must_use]
    pub fn replayed(&self) -> &[Event<M>] {
        &self.replayed
    }

    /// Stream that yields the replayed events first, then live updates.
    ///
    /// Live events already covered by the replay are skipped.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Event<M>> {
        self.cursor.with_history(self.replayed).into_stream()
    }
}

/// Session manager for resumable streams.
///
/// Every published message is appended to the shared [`EventLog`] and then
/// broadcast to the stream's live subscribers. A reconnecting client cites
/// the last event id it processed and gets the gap replayed from the log.
///
/// Live channels exist only while a stream has subscribers.
pub struct StreamSessionManager<M> {
    log: Arc<EventLog<M>>,
    /// Publishes and subscriptions hold this lock, so a subscriber's start
    /// position and its receiver always agree.
    channels: Arc<Mutex<Channels<M>>>,
}

impl<M> StreamSessionManager<M>
where
    M: Send + Sync + 'static,
{
    /// Create a new session manager over a shared log.
    #[must_use]
    pub fn new(log: Arc<EventLog<M>>) -> Self {
        Self {
            log,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying event log.
    #[must_use]
    pub const fn log(&self) -> &Arc<EventLog<M>> {
        &self.log
    }

    /// Register a receiver, returning it with the stream tail it starts after.
    fn subscription(&self, stream_id: &StreamId) -> (Subscription<M>, Option<EventId>) {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(stream_id.clone())
            .or_insert_with(|| Arc::new(broadcast::channel(LIVE_CHANNEL_CAPACITY).0));
        let receiver = sender.subscribe();
        let channel = Arc::downgrade(sender);
        let tail = self.log.latest(stream_id);
        drop(channels);

        let subscription = Subscription {
            receiver: Some(receiver),
            stream_id: stream_id.clone(),
            channel,
            channels: Arc::clone(&self.channels),
        };
        (subscription, tail)
    }

    /// Open a new stream with a fresh id.
    ///
    /// Nothing is allocated until the stream is published to or subscribed.
    #[must_use]
    pub fn open_stream(&self) -> StreamId {
        let stream_id = StreamId::generate();
        info!(stream_id = %stream_id, "Stream opened");
        stream_id
    }

    /// Append a message to a stream and broadcast it to live subscribers.
    ///
    /// Streams that were never opened are created on first publish.
    pub fn publish(&self, stream_id: &StreamId, payload: M) -> EventId {
        let channels = self.channels.lock();
        let event = self.log.append_event(stream_id, payload);
        let event_id = event.event_id();
        if let Some(sender) = channels.get(stream_id) {
            // Receivers may all be mid-drop; the log keeps the event.
            let _ = sender.send(event);
        }
        event_id
    }

    /// Live events for a stream, starting now.
    #[must_use]
    pub fn subscribe(&self, stream_id: &StreamId) -> BoxStream<'static, Event<M>> {
        let (subscription, tail) = self.subscription(stream_id);
        LiveCursor::new(Arc::clone(&self.log), subscription, tail).into_stream()
    }

    /// Resume the stream `last_event_id` belongs to.
    ///
    /// # Errors
    /// Returns error if the anchor is unknown or has been evicted; the
    /// caller should open a fresh stream instead.
    pub async fn resume(&self, last_event_id: EventId) -> Result<Resumed<M>, SessionError> {
        let Some(stream_id) = self.log.stream_of(&last_event_id) else {
            warn!(event_id = %last_event_id, "Cannot resume: event not found");
            return Err(ReplayError::NotFound(last_event_id).into());
        };

        // Subscribe before replaying so nothing slips between the two.
        let (subscription, _) = self.subscription(&stream_id);

        let mut replayed: Vec<Event<M>> = Vec::new();
        let stream_id = self
            .log
            .replay_events_after(last_event_id, &mut replayed)
            .await?;

        info!(stream_id = %stream_id, replayed = replayed.len(), "Stream resumed");
        Ok(Resumed {
            stream_id,
            replayed,
            cursor: LiveCursor::new(Arc::clone(&self.log), subscription, Some(last_event_id)),
        })
    }

    /// Close a stream for good, ending its live subscribers and dropping its
    /// buffered events.
    pub fn close_stream(&self, stream_id: &StreamId) -> usize {
        self.channels.lock().remove(stream_id);
        let dropped = self.log.drop_stream(stream_id);
        info!(stream_id = %stream_id, dropped, "Stream closed");
        dropped
    }

    /// Number of streams with live subscribers.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.channels.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn manager(capacity: usize) -> StreamSessionManager<String> {
        StreamSessionManager::new(Arc::new(EventLog::with_capacity(capacity).unwrap()))
    }

    async fn next_payload(stream: &mut BoxStream<'static, Event<String>>) -> String {
        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event within timeout")
            .expect("stream open");
        event.payload().clone()
    }

    async fn assert_ended(stream: &mut BoxStream<'static, Event<String>>) {
        let next = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream ends within timeout");
        assert!(next.is_none());
    }

    #[test]
    fn test_open_streams_are_distinct() {
        let manager = manager(10);
        let a = manager.open_stream();
        let b = manager.open_stream();
        assert_ne!(a, b);
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_live_subscriber() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let mut live = manager.subscribe(&stream);
        assert_eq!(manager.active_streams(), 1);

        manager.publish(&stream, "hello".to_string());
        assert_eq!(next_payload(&mut live).await, "hello");
    }

    #[test]
    fn test_subscriber_is_woken_by_publish() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let mut live = task::spawn(manager.subscribe(&stream));
        assert_pending!(live.poll_next());

        manager.publish(&stream, "wake".to_string());
        assert!(live.is_woken());
        let event = assert_ready!(live.poll_next()).expect("stream open");
        assert_eq!(event.payload().as_str(), "wake");
        assert_pending!(live.poll_next());
    }

    #[tokio::test]
    async fn test_resume_replays_gap_then_continues_live() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let anchor = manager.publish(&stream, "a".to_string());
        manager.publish(&stream, "b".to_string());
        manager.publish(&stream, "c".to_string());

        let resumed = manager.resume(anchor).await.unwrap();
        assert_eq!(resumed.stream_id(), &stream);
        assert_eq!(resumed.replayed().len(), 2);

        let mut events = resumed.into_stream();
        manager.publish(&stream, "d".to_string());

        assert_eq!(next_payload(&mut events).await, "b");
        assert_eq!(next_payload(&mut events).await, "c");
        assert_eq!(next_payload(&mut events).await, "d");
    }

    #[tokio::test]
    async fn test_resume_at_tail_is_empty_success() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let tail = manager.publish(&stream, "only".to_string());

        let resumed = manager.resume(tail).await.unwrap();
        assert!(resumed.replayed().is_empty());
        assert_eq!(resumed.stream_id(), &stream);
    }

    #[tokio::test]
    async fn test_resume_evicted_anchor_fails() {
        let manager = manager(2);
        let stream = manager.open_stream();
        let first = manager.publish(&stream, "1".to_string());
        manager.publish(&stream, "2".to_string());
        manager.publish(&stream, "3".to_string());

        let err = manager.resume(first).await.err().unwrap();
        assert!(err.is_not_found());
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_resume_unknown_anchor_fails() {
        let manager = manager(2);
        assert!(manager.resume(EventId::new()).await.err().unwrap().is_not_found());
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_resume_does_not_cross_streams() {
        let manager = manager(10);
        let s1 = manager.open_stream();
        let s2 = manager.open_stream();
        let x = manager.publish(&s1, "x".to_string());
        manager.publish(&s2, "y".to_string());

        let resumed = manager.resume(x).await.unwrap();
        assert_eq!(resumed.stream_id(), &s1);
        assert!(resumed.replayed().is_empty());
    }

    #[tokio::test]
    async fn test_close_stream_invalidates_resume() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let anchor = manager.publish(&stream, "a".to_string());
        manager.publish(&stream, "b".to_string());

        assert_eq!(manager.close_stream(&stream), 2);
        assert_eq!(manager.active_streams(), 0);
        assert!(manager.resume(anchor).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_close_stream_ends_live_subscribers() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let mut live = manager.subscribe(&stream);

        manager.close_stream(&stream);
        assert_ended(&mut live).await;
        assert_eq!(manager.active_streams(), 0);
    }

    #[test]
    fn test_publish_to_unopened_stream_creates_it() {
        let manager = manager(10);
        let stream = StreamId::from("adhoc");
        manager.publish(&stream, "a".to_string());
        assert_eq!(manager.log().stream_len(&stream), 1);
        // Nobody listens, so no live channel is kept.
        assert_eq!(manager.active_streams(), 0);
    }

    #[test]
    fn test_dropped_subscriptions_release_channels() {
        let manager = manager(10);
        for _ in 0..1000 {
            drop(manager.subscribe(&StreamId::generate()));
        }
        assert_eq!(manager.active_streams(), 0);
        assert_eq!(manager.log().stats().streams, 0);
    }

    #[tokio::test]
    async fn test_channel_lives_until_last_subscriber_drops() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let first = manager.subscribe(&stream);
        let mut second = manager.subscribe(&stream);

        drop(first);
        assert_eq!(manager.active_streams(), 1);
        manager.publish(&stream, "still live".to_string());
        assert_eq!(next_payload(&mut second).await, "still live");

        drop(second);
        assert_eq!(manager.active_streams(), 0);
    }

    #[test]
    fn test_subscription_after_close_keeps_new_channel() {
        let manager = manager(10);
        let stream = manager.open_stream();
        let stale = manager.subscribe(&stream);
        manager.close_stream(&stream);
        let fresh = manager.subscribe(&stream);

        // The stale subscription must not remove the channel that replaced it.
        drop(stale);
        assert_eq!(manager.active_streams(), 1);
        drop(fresh);
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_refills_from_log() {
        let manager = manager(2 * LIVE_CHANNEL_CAPACITY);
        let stream = manager.open_stream();
        let mut live = manager.subscribe(&stream);

        let total = LIVE_CHANNEL_CAPACITY + 76;
        for n in 0..total {
            manager.publish(&stream, n.to_string());
        }
        for n in 0..total {
            assert_eq!(next_payload(&mut live).await, n.to_string());
        }

        manager.publish(&stream, "after".to_string());
        assert_eq!(next_payload(&mut live).await, "after");
    }

    #[tokio::test]
    async fn test_lagging_resumed_stream_refills_from_log() {
        let manager = manager(2 * LIVE_CHANNEL_CAPACITY);
        let stream = manager.open_stream();
        let anchor = manager.publish(&stream, "anchor".to_string());
        manager.publish(&stream, "missed".to_string());

        let mut events = manager.resume(anchor).await.unwrap().into_stream();
        let total = LIVE_CHANNEL_CAPACITY + 10;
        for n in 0..total {
            manager.publish(&stream, n.to_string());
        }

        assert_eq!(next_payload(&mut events).await, "missed");
        for n in 0..total {
            assert_eq!(next_payload(&mut events).await, n.to_string());
        }
    }

    #[tokio::test]
    async fn test_lag_past_log_capacity_ends_stream() {
        let manager = manager(10);
        let stream = manager.open_stream();
        manager.publish(&stream, "before".to_string());
        let mut live = manager.subscribe(&stream);

        for n in 0..=LIVE_CHANNEL_CAPACITY {
            manager.publish(&stream, n.to_string());
        }
        assert_ended(&mut live).await;
    }
}
