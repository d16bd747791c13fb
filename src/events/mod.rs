//! Event bus: fan-out of lifecycle events to bounded-buffer subscribers.
//!
//! Emission is best-effort and never blocks an emitting scheduler task:
//! each subscriber owns a bounded FIFO buffer, a full buffer drops the
//! event for that subscriber, and a per-subscriber drop counter records
//! the loss so consumers can distinguish drops from inactivity.

use crate::core::Event;
use crate::errors::EngineError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

struct Sink {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Fan-out bus with bounded per-subscriber buffers.
pub struct EventBus {
    sinks: RwLock<HashMap<String, Sink>>,
    default_capacity: usize,
}

impl EventBus {
    /// Creates a bus with the given default subscriber capacity.
    #[must_use]
    pub fn new(default_capacity: usize) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Registers a subscriber and returns its receiving handle.
    ///
    /// The subscription receives events emitted strictly after this call.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the id is already subscribed.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        capacity: Option<usize>,
    ) -> Result<Subscription, EngineError> {
        let id = id.into();
        let mut sinks = self.sinks.write();
        if sinks.contains_key(&id) {
            return Err(EngineError::duplicate("subscriber", &id));
        }

        let capacity = capacity.unwrap_or(self.default_capacity).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        sinks.insert(
            id.clone(),
            Sink {
                tx,
                dropped: dropped.clone(),
            },
        );

        Ok(Subscription { id, rx, dropped })
    }

    /// Deregisters a subscriber, closing its sink.
    ///
    /// Events already buffered remain readable on the [`Subscription`]
    /// until it drains, after which `recv` returns `None`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is not subscribed.
    pub fn unsubscribe(&self, id: &str) -> Result<(), EngineError> {
        self.sinks
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found("subscriber", id))
    }

    /// Emits an event to every subscriber without blocking.
    ///
    /// A full or closed sink drops the event for that subscriber and
    /// increments its drop counter.
    pub fn emit(&self, event: Event) {
        let sinks = self.sinks.read();
        for (id, sink) in sinks.iter() {
            if sink.tx.try_send(event.clone()).is_err() {
                let total = sink.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscriber = %id,
                    event_type = %event.event_type,
                    dropped_total = total,
                    "event dropped: subscriber buffer full"
                );
            }
        }
    }

    /// The drop counter for a subscriber, if it exists.
    #[must_use]
    pub fn dropped(&self, id: &str) -> Option<u64> {
        self.sinks
            .read()
            .get(id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

/// The receiving half of a subscription.
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// The subscriber id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receives the next event; `None` after unsubscribe once the buffer
    /// drains.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receives without waiting; `None` when the buffer is empty.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// How many events were dropped for this subscriber.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> Event {
        Event::new(format!("test.{n}"), "p1")
    }

    #[tokio::test]
    async fn test_subscribe_and_receive_in_order() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe("s1", None).unwrap();

        bus.emit(event(1));
        bus.emit(event(2));
        bus.emit(event(3));

        assert_eq!(sub.recv().await.unwrap().event_type, "test.1");
        assert_eq!(sub.recv().await.unwrap().event_type, "test.2");
        assert_eq!(sub.recv().await.unwrap().event_type, "test.3");
    }

    #[tokio::test]
    async fn test_duplicate_subscriber_rejected() {
        let bus = EventBus::new(10);
        let _sub = bus.subscribe("s1", None).unwrap();
        assert!(matches!(
            bus.subscribe("s1", None),
            Err(EngineError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_and_counts() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe("slow", Some(2)).unwrap();

        bus.emit(event(1));
        bus.emit(event(2));
        bus.emit(event(3));
        bus.emit(event(4));

        assert_eq!(sub.dropped(), 2);
        assert_eq!(bus.dropped("slow"), Some(2));

        // The two buffered events are still delivered, in order.
        assert_eq!(sub.recv().await.unwrap().event_type, "test.1");
        assert_eq!(sub.recv().await.unwrap().event_type, "test.2");
    }

    #[tokio::test]
    async fn test_unsubscribe_drains_then_closes() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe("s1", None).unwrap();

        bus.emit(event(1));
        bus.unsubscribe("s1").unwrap();

        // Buffered event still drains, then the sink closes.
        assert_eq!(sub.recv().await.unwrap().event_type, "test.1");
        assert!(sub.recv().await.is_none());

        assert!(matches!(
            bus.unsubscribe("s1"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_events_before_subscription() {
        let bus = EventBus::new(10);
        bus.emit(event(1));

        let mut sub = bus.subscribe("late", None).unwrap();
        bus.emit(event(2));

        assert_eq!(sub.recv().await.unwrap().event_type, "test.2");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let bus = EventBus::new(10);
        let mut a = bus.subscribe("a", None).unwrap();
        let mut b = bus.subscribe("b", None).unwrap();

        bus.emit(event(1));

        assert_eq!(a.recv().await.unwrap().event_type, "test.1");
        assert_eq!(b.recv().await.unwrap().event_type, "test.1");
    }
}
