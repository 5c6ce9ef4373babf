//! Multi-listener change notification with thread-targeted delivery.
//!
//! # Thread Safety
//!
//! - **Listener list**: `ArcSwap<Vec<Arc<ListenerEntry>>>`. `fire()` takes a
//!   wait-free snapshot; `connect` and handle release publish a new list
//!   copy-on-write.
//! - **Writers**: serialized by a `Mutex` that only control-thread code takes.
//! - **Retired allocations**: every replaced list and every removed entry is
//!   parked in the writer's retire list until nothing else references it, so a
//!   reader on the processing thread never drops the last reference.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::dispatch::{Dispatcher, ListenerEntry, ListenerSource};
use crate::scoped_callback::{Deregister, ListenerId, ScopedCallback};
use crate::thread::{CallbackThread, is_processing_thread};

type Retired = Arc<dyn Any + Send + Sync>;

struct Registry {
    entries: ArcSwap<Vec<Arc<ListenerEntry>>>,
    /// Writer lock; the guarded vec holds retired allocations.
    writer: Mutex<Vec<Retired>>,
    next_id: AtomicU64,
    dispatcher: OnceLock<Arc<Dispatcher>>,
    /// Cross-thread deliveries skipped because no dispatcher was bound.
    undelivered: AtomicUsize,
}

impl Registry {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            dispatcher: OnceLock::new(),
            undelivered: AtomicUsize::new(0),
        }
    }

    fn release_retired(retired: &mut Vec<Retired>) {
        retired.retain(|allocation| Arc::strong_count(allocation) > 1);
    }
}

impl ListenerSource for Registry {
    fn visit(&self, f: &mut dyn FnMut(&Arc<ListenerEntry>)) {
        for entry in self.entries.load_full().iter() {
            f(entry);
        }
    }
}

impl Deregister for Registry {
    fn deregister(&self, id: ListenerId) {
        debug_assert!(
            !is_processing_thread(),
            "listener released on the processing thread"
        );
        let mut retired = self.writer.lock();
        let current = self.entries.load_full();
        let Some(entry) = current.iter().find(|e| e.id == id) else {
            return;
        };
        entry.deactivate();
        let removed: Retired = Arc::clone(entry) as Retired;

        let next: Vec<_> = current.iter().filter(|e| e.id != id).cloned().collect();
        self.entries.store(Arc::new(next));

        retired.push(current as Retired);
        retired.push(removed);
        Self::release_retired(&mut retired);
        tracing::debug!(listener = id.0, "listener removed");
    }
}

/// A set of listeners notified when something changes.
///
/// Each listener is registered for a [`CallbackThread`]. When the broadcaster
/// fires, listeners registered for the firing thread run immediately, in
/// registration order. Listeners registered for the other thread are handed
/// to the bound [`Dispatcher`] and run when that thread drains it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use sonido_state::{CallbackThread, ChangeBroadcaster, Dispatcher, ProcessingScope};
///
/// let dispatcher = Arc::new(Dispatcher::new(16, 16));
/// let broadcaster = ChangeBroadcaster::with_dispatcher(Arc::clone(&dispatcher));
///
/// let hits = Arc::new(AtomicU32::new(0));
/// let h = Arc::clone(&hits);
/// let _listener = broadcaster.connect(CallbackThread::Control, move || {
///     h.fetch_add(1, Ordering::Relaxed);
/// });
///
/// {
///     let _scope = ProcessingScope::enter();
///     broadcaster.fire(); // queued for the control thread
///     broadcaster.fire(); // coalesced
/// }
/// assert_eq!(hits.load(Ordering::Relaxed), 0);
/// dispatcher.dispatch_control();
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
/// ```
pub struct ChangeBroadcaster {
    registry: Arc<Registry>,
}

impl ChangeBroadcaster {
    /// Create a broadcaster with no dispatcher bound.
    ///
    /// Same-thread listeners work immediately. Cross-thread deliveries need a
    /// dispatcher, bound later with [`bind_dispatcher`](Self::bind_dispatcher)
    /// (plugin state does this in `initialise`).
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Create a broadcaster that delivers cross-thread through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let broadcaster = Self::new();
        broadcaster.bind_dispatcher(dispatcher);
        broadcaster
    }

    /// Bind the dispatcher used for cross-thread delivery.
    ///
    /// A broadcaster binds once; returns `false` if a dispatcher was already
    /// bound (the existing one is kept).
    pub fn bind_dispatcher(&self, dispatcher: Arc<Dispatcher>) -> bool {
        if self.registry.dispatcher.set(Arc::clone(&dispatcher)).is_err() {
            return false;
        }
        dispatcher.track(Arc::downgrade(&self.registry) as Weak<dyn ListenerSource>);
        true
    }

    /// Whether a dispatcher is bound.
    pub fn has_dispatcher(&self) -> bool {
        self.registry.dispatcher.get().is_some()
    }

    /// Register `callback` for delivery on `thread`.
    ///
    /// The listener stays registered until the returned handle is dropped.
    /// Control thread only.
    pub fn connect<F>(&self, thread: CallbackThread, callback: F) -> ScopedCallback
    where
        F: Fn() + Send + Sync + 'static,
    {
        debug_assert!(
            !is_processing_thread(),
            "listener registered on the processing thread"
        );
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(ListenerEntry::new(id, thread, Box::new(callback)));

        let mut retired = self.registry.writer.lock();
        let current = self.registry.entries.load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(entry);
        self.registry.entries.store(Arc::new(next));
        retired.push(current as Retired);
        Registry::release_retired(&mut retired);
        drop(retired);

        tracing::debug!(listener = id.0, ?thread, "listener added");
        let registry: Weak<dyn Deregister> =
            Arc::downgrade(&self.registry) as Weak<dyn Deregister>;
        ScopedCallback::new(registry, id)
    }

    /// Notify every listener.
    ///
    /// Listeners for the calling thread run now; the rest are queued. From the
    /// processing thread this neither locks nor allocates.
    pub fn fire(&self) {
        let origin = CallbackThread::current();
        let entries = self.registry.entries.load();
        for entry in entries.iter() {
            if !entry.is_active() {
                continue;
            }
            if entry.thread == origin {
                entry.invoke();
            } else if let Some(dispatcher) = self.registry.dispatcher.get() {
                dispatcher.enqueue(entry);
            } else {
                self.registry.undelivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.entries.load().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listener_count() == 0
    }

    /// Cross-thread deliveries skipped because no dispatcher was bound.
    pub fn undelivered(&self) -> usize {
        self.registry.undelivered.load(Ordering::Relaxed)
    }

    /// Free retired listener lists that no reader still holds.
    ///
    /// Registration and release do this on their own; plugin state also calls
    /// it after every control drain. Control thread only.
    pub fn release_retired(&self) {
        Registry::release_retired(&mut self.registry.writer.lock());
    }

    /// Number of retired allocations still parked.
    pub fn retired_count(&self) -> usize {
        self.registry.writer.lock().len()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBroadcaster")
            .field("listeners", &self.listener_count())
            .field("has_dispatcher", &self.has_dispatcher())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ProcessingScope;
    use std::sync::atomic::AtomicU32;

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn bound() -> (ChangeBroadcaster, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::new(8, 8));
        (
            ChangeBroadcaster::with_dispatcher(Arc::clone(&dispatcher)),
            dispatcher,
        )
    }

    #[test]
    fn same_thread_listener_runs_inline() {
        let (broadcaster, _dispatcher) = bound();
        let (count, cb) = counter();
        let _handle = broadcaster.connect(CallbackThread::Control, cb);

        broadcaster.fire();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cross_thread_listener_waits_for_drain() {
        let (broadcaster, dispatcher) = bound();
        let (count, cb) = counter();
        let _handle = broadcaster.connect(CallbackThread::Processing, cb);

        broadcaster.fire();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        {
            let _scope = ProcessingScope::enter();
            dispatcher.dispatch_processing();
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn registration_order_is_delivery_order() {
        let (broadcaster, dispatcher) = bound();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let order = Arc::clone(&order);
                broadcaster.connect(CallbackThread::Control, move || order.lock().push(i))
            })
            .collect();

        {
            let _scope = ProcessingScope::enter();
            broadcaster.fire();
        }
        dispatcher.dispatch_control();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        drop(handles);
    }

    #[test]
    fn more_listeners_than_queue_slots_all_delivered() {
        let dispatcher = Arc::new(Dispatcher::new(2, 2));
        let broadcaster = ChangeBroadcaster::with_dispatcher(Arc::clone(&dispatcher));
        let (count, _) = counter();
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let c = Arc::clone(&count);
                broadcaster.connect(CallbackThread::Control, move || {
                    c.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        {
            let _scope = ProcessingScope::enter();
            broadcaster.fire();
        }
        assert_eq!(dispatcher.dispatch_control(), 6);
        assert_eq!(count.load(Ordering::Relaxed), 6);
        assert_eq!(dispatcher.dispatch_control(), 0);
        drop(handles);
    }

    #[test]
    fn dropping_handle_stops_delivery() {
        let (broadcaster, _dispatcher) = bound();
        let (count, cb) = counter();
        let handle = broadcaster.connect(CallbackThread::Control, cb);
        assert_eq!(broadcaster.listener_count(), 1);

        drop(handle);
        assert_eq!(broadcaster.listener_count(), 0);
        broadcaster.fire();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn release_suppresses_queued_delivery() {
        let (broadcaster, dispatcher) = bound();
        let (count, cb) = counter();
        let handle = broadcaster.connect(CallbackThread::Control, cb);

        {
            let _scope = ProcessingScope::enter();
            broadcaster.fire();
        }
        assert_eq!(dispatcher.pending_control(), 1);

        drop(handle);
        assert_eq!(dispatcher.dispatch_control(), 0);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn retired_lists_are_released_once_unreferenced() {
        let (broadcaster, dispatcher) = bound();
        let (_count, cb) = counter();
        let handle = broadcaster.connect(CallbackThread::Control, cb);
        {
            let _scope = ProcessingScope::enter();
            broadcaster.fire();
        }
        drop(handle);
        // The queued delivery still references the removed entry.
        assert!(broadcaster.retired_count() > 0);

        dispatcher.dispatch_control();
        broadcaster.release_retired();
        assert_eq!(broadcaster.retired_count(), 0);
    }

    #[test]
    fn unbound_broadcaster_counts_undelivered() {
        let broadcaster = ChangeBroadcaster::new();
        let (count, cb) = counter();
        let _handle = broadcaster.connect(CallbackThread::Processing, cb);

        broadcaster.fire();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(broadcaster.undelivered(), 1);
    }

    #[test]
    fn bind_dispatcher_only_once() {
        let broadcaster = ChangeBroadcaster::new();
        assert!(!broadcaster.has_dispatcher());
        assert!(broadcaster.bind_dispatcher(Arc::new(Dispatcher::default())));
        assert!(!broadcaster.bind_dispatcher(Arc::new(Dispatcher::default())));
        assert!(broadcaster.has_dispatcher());
    }

    #[test]
    fn handle_outliving_broadcaster_is_harmless() {
        let (broadcaster, _dispatcher) = bound();
        let (_count, cb) = counter();
        let handle = broadcaster.connect(CallbackThread::Control, cb);
        drop(broadcaster);
        assert!(!handle.is_connected());
        drop(handle);
    }
}
