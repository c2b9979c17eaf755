//! A small synchronous fan-out hub for state-change notifications.
//!
//! Used by [`crate::microbot::Microbot`] to notify subscribers whenever
//! its paired/connected/pusher state changes. Callbacks run
//! synchronously on the caller's task; they must be fast and must not
//! call back into BLE-issuing APIs (see the concurrency design notes).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// A registered subscription. Dropping this does not cancel the
/// subscription; call [`SubscribeHandle::cancel`] explicitly.
pub struct SubscribeHandle<T> {
    id: u64,
    subscribers: std::sync::Weak<StdMutex<Vec<(u64, Arc<dyn Fn(T) + Send + Sync>)>>>,
}

impl<T> SubscribeHandle<T> {
    /// Remove this subscriber from the hub.
    pub fn cancel(self) {
        if let Some(subs) = self.subscribers.upgrade() {
            subs.lock()
                .expect("subscribe hub lock poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Fan-out hub for one event type. Subscribers are invoked in
/// registration order every time [`SubscribeHub::fire`] is called.
pub struct SubscribeHub<T: Clone> {
    subscribers: Arc<StdMutex<Vec<(u64, Arc<dyn Fn(T) + Send + Sync>)>>>,
    next_id: AtomicU64,
}

impl<T: Clone> SubscribeHub<T> {
    /// An empty hub.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a subscriber, returning a handle to cancel it later.
    pub fn subscribe(&self, callback: impl Fn(T) + Send + Sync + 'static) -> SubscribeHandle<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscribe hub lock poisoned")
            .push((id, Arc::new(callback)));
        SubscribeHandle {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Invoke every current subscriber with `value`, taking a snapshot
    /// of the subscriber list first so a subscriber cancelling itself
    /// mid-fire is safe.
    pub fn fire(&self, value: T) {
        let callbacks: Vec<Arc<dyn Fn(T) + Send + Sync>> = self
            .subscribers
            .lock()
            .expect("subscribe hub lock poisoned")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(value.clone());
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscribe hub lock poisoned").len()
    }
}

impl<T: Clone> Default for SubscribeHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    #[test]
    fn fire_invokes_all_subscribers_in_registration_order() {
        let hub: SubscribeHub<i32> = SubscribeHub::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        hub.subscribe(move |v| o1.lock().unwrap().push(("a", v)));
        let o2 = Arc::clone(&order);
        hub.subscribe(move |v| o2.lock().unwrap().push(("b", v)));

        hub.fire(42);
        assert_eq!(*order.lock().unwrap(), vec![("a", 42), ("b", 42)]);
    }

    #[test]
    fn cancel_removes_the_subscriber() {
        let hub: SubscribeHub<i32> = SubscribeHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handle = hub.subscribe(move |_| {
            count_clone.fetch_add(1, AOrdering::SeqCst);
        });

        hub.fire(1);
        handle.cancel();
        hub.fire(2);

        assert_eq!(count.load(AOrdering::SeqCst), 1);
    }
}
