//! Snapshot listeners.
//!
//! Listeners run on the engine task, once per mutation, with the new
//! snapshot. They must not block. The registry lock is not held while they
//! run, so a listener may subscribe or drop its own `Subscription`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::session::SessionSnapshot;

pub type Listener = Box<dyn Fn(Arc<SessionSnapshot>) + Send + Sync>;

#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, Arc<Listener>>>,
}

impl Subscribers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(listener));
        debug!(subscription = id, "Listener subscribed");
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver a snapshot to every listener, in subscription order.
    pub fn notify(&self, snapshot: &Arc<SessionSnapshot>) {
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(snapshot.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        let removed = self
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!(subscription = id, "Listener unsubscribed");
        }
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// A listener that forwards snapshots into a channel.
pub fn channel_listener() -> (Listener, mpsc::UnboundedReceiver<Arc<SessionSnapshot>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Box::new(move |snapshot| {
        let _ = tx.send(snapshot);
    });
    (listener, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_and_unsubscribe() {
        let subscribers = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = subscribers.subscribe(counting(&hits));
        let snapshot = Arc::new(SessionSnapshot::empty("s1"));

        subscribers.notify(&snapshot);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        subscribers.notify(&snapshot);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subscribers = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let _sub = subscribers.subscribe(counting(&hits));
            assert_eq!(subscribers.len(), 1);
        }
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_listener_can_drop_its_own_subscription() {
        let subscribers = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let own = slot.clone();
        let counter = hits.clone();
        let sub = subscribers.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            own.lock().unwrap().take();
        }));
        *slot.lock().unwrap() = Some(sub);

        let snapshot = Arc::new(SessionSnapshot::empty("s1"));
        subscribers.notify(&snapshot);
        assert!(subscribers.is_empty());

        subscribers.notify(&snapshot);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_subscribe_during_notify() {
        let subscribers = Subscribers::new();
        let registry = subscribers.clone();
        let added: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = added.clone();
        let _sub = subscribers.subscribe(Box::new(move |_| {
            let extra = registry.subscribe(Box::new(|_| {}));
            sink.lock().unwrap().push(extra);
        }));

        subscribers.notify(&Arc::new(SessionSnapshot::empty("s1")));
        assert_eq!(subscribers.len(), 2);
    }

    #[test]
    fn test_channel_listener() {
        let subscribers = Subscribers::new();
        let (listener, mut rx) = channel_listener();
        let _sub = subscribers.subscribe(listener);

        subscribers.notify(&Arc::new(SessionSnapshot::empty("s1")));
        assert_eq!(rx.try_recv().unwrap().session_id, "s1");
    }
}
