//! Listener registration with lock-free snapshots.
//!
//! Registration and removal are serialized by a private mutex; every mutation
//! publishes a new immutable `Vec` through an [`ArcSwap`]. Dispatchers load the
//! latest snapshot without taking any lock, so:
//!
//! - registering a listener never blocks or corrupts an in-progress fan-out,
//! - a listener added mid-dispatch does not see the event being dispatched,
//! - iteration order is insertion order and stable for one dispatch.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Handle returned by [`ListenerSet::register`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Immutable point-in-time view of the registered listeners.
pub type ListenerSnapshot<L> = Arc<Vec<(ListenerId, Arc<L>)>>;

/// Insertion-ordered set of listeners.
pub struct ListenerSet<L: ?Sized> {
    next_id: Mutex<u64>,
    snapshot: ArcSwap<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(0),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Add a listener at the end of the iteration order.
    pub fn register(&self, listener: Arc<L>) -> ListenerId {
        let mut next_id = self.next_id.lock();
        let id = ListenerId(*next_id);
        *next_id += 1;

        let mut listeners: Vec<_> = self.snapshot.load().iter().cloned().collect();
        listeners.push((id, listener));
        self.snapshot.store(Arc::new(listeners));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let _guard = self.next_id.lock();
        let current = self.snapshot.load();
        if !current.iter().any(|(registered, _)| *registered == id) {
            return false;
        }
        let listeners = current
            .iter()
            .filter(|(registered, _)| *registered != id)
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(listeners));
        true
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> ListenerSnapshot<L> {
        self.snapshot.load_full()
    }

    /// Invoke `notify` on every listener of the current snapshot.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// are still notified. Returns the number of listeners that completed.
    pub fn fan_out<F>(&self, event: &str, notify: F) -> usize
    where
        F: Fn(&L),
    {
        let snapshot = self.snapshot();
        let mut delivered = 0;
        for (id, listener) in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| notify(listener))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(
                        event,
                        listener = ?id,
                        "Listener failed while handling '{}': {}",
                        event,
                        reason
                    );
                }
            }
        }
        delivered
    }
}
