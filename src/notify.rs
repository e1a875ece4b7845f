//! Publish/subscribe channel with per-tick coalescing.
//!
//! Every [`ListenerSet::notify`] call queues a value. The first value queued
//! since the last flush schedules one flush task on the current tokio runtime,
//! which yields once (the scheduling tick) and then hands the whole batch to
//! every listener. Several dispatches within one tick therefore reach
//! listeners as a single call.
//!
//! Without a runtime the batch is delivered synchronously.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<V> = Arc<dyn Fn(&[V]) + Send + Sync>;

struct Inner<V> {
    listeners: DashMap<u64, Listener<V>>,
    next_id: AtomicU64,
    pending: Mutex<Vec<V>>,
}

impl<V> Inner<V> {
    fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        // Snapshot first so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener<V>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener(&batch);
        }
    }
}

/// A set of listeners receiving coalesced batches of `V`.
pub struct ListenerSet<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ListenerSet<V> {
    fn clone(&self) -> Self {
        ListenerSet {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> ListenerSet<V> {
    pub fn new() -> Self {
        ListenerSet {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                next_id: AtomicU64::new(0),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned guard is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[V]) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Arc::new(listener));

        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(&id);
            }
        })
    }

    /// Queue `value` for the next flush.
    pub fn notify(&self, value: V) {
        let schedule = {
            let mut pending = self.inner.pending.lock();
            pending.push(value);
            pending.len() == 1
        };
        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    inner.flush();
                });
            }
            Err(_) => self.inner.flush(),
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.listeners.is_empty()
    }
}

impl<V: Send + Sync + 'static> Default for ListenerSet<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration guard; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
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
    use std::time::Duration;

    #[tokio::test]
    async fn test_notifications_coalesce_per_tick() {
        let set = ListenerSet::<u32>::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let _sub = set.subscribe(move |batch| sink.lock().push(batch.to_vec()));

        set.notify(1);
        set.notify(2);
        set.notify(3);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(*calls.lock(), vec![vec![1, 2, 3]]);

        set.notify(4);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let set = ListenerSet::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let sub = set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(set.len(), 1);

        drop(sub);
        assert!(set.is_empty());

        set.notify(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_flushes_synchronously_without_runtime() {
        let set = ListenerSet::<&'static str>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = set.subscribe(move |batch| sink.lock().extend_from_slice(batch));

        set.notify("a");
        assert_eq!(*seen.lock(), vec!["a"]);
    }
}
