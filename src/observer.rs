//! Listener registry shared by the store, the document and presence.
//!
//! Listeners are snapshotted before dispatch so no lock is held while user
//! callbacks run; a callback may freely mutate the component that invoked it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Produced by this process (editor action, bootstrap)
    Local,
    /// Applied from a peer through the transport
    Remote,
}

impl Origin {
    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Remote)
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// A set of callbacks notified with `&T`
pub struct Observers<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it stays registered until the returned guard drops
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut set = self.inner.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Call every registered listener with `value`
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(value);
        }
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.inner.lock().listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard returned by every `subscribe`/`observe` call.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the listener.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_reaches_all_listeners() {
        let observers = Observers::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = observers.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = observers.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        observers.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observers = Observers::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let sub = observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        observers.notify(&());
        drop(sub);
        observers.notify(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_listener_may_subscribe_during_notify() {
        let observers = Arc::new(Observers::<()>::new());
        let nested = Arc::new(Mutex::new(Vec::new()));

        let obs = observers.clone();
        let held = nested.clone();
        let _sub = observers.subscribe(move |_| {
            held.lock().push(obs.subscribe(|_| {}));
        });

        observers.notify(&());
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let observers = Observers::<()>::new();
        let sub = observers.subscribe(|_| {});
        drop(observers);
        sub.unsubscribe();
    }
}
