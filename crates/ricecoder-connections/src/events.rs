//! Callback-based notifications
//!
//! Every component that exposes notifications owns an [`EventEmitter`] for its
//! own event enum. Delivery is synchronous: `emit` calls every subscriber that
//! is registered at the time of the call, in registration order, before it
//! returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`EventEmitter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of subscribers for one event type
pub struct EventEmitter<E> {
    subscribers: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback for every future event
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscriber; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Delivers an event to the current subscribers
    pub fn emit(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly
        let snapshot: Vec<Callback<E>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    /// Removes every subscriber
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_registration_order() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            emitter.subscribe(move |value: &u32| seen.lock().push((tag, *value)));
        }

        emitter.emit(&7);
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let emitter = EventEmitter::<()>::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let id = emitter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&());
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_added_during_emit_misses_current_event() {
        let emitter = Arc::new(EventEmitter::<u8>::new());
        let late_calls = Arc::new(AtomicU64::new(0));

        let inner = Arc::clone(&emitter);
        let late = Arc::clone(&late_calls);
        emitter.subscribe(move |_| {
            let late = Arc::clone(&late);
            inner.subscribe(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        emitter.emit(&1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.subscriber_count(), 2);
    }

    #[test]
    fn test_clear() {
        let emitter = EventEmitter::<u8>::new();
        emitter.subscribe(|_| {});
        emitter.subscribe(|_| {});
        emitter.clear();
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
