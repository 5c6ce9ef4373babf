//! Cross-thread notification hand-off.
//!
//! A [`Dispatcher`] owns two bounded queues: one carrying notifications fired
//! on the processing thread for control-thread listeners, and one carrying the
//! reverse direction. Both are allocated up front; pushing is a lock-free
//! `try_send` of an `Arc` clone.
//!
//! Deliveries are coalesced per listener: a listener that is already waiting
//! in a queue is not queued again, so any number of fires between two drains
//! produce one callback.
//!
//! A full queue defers a delivery instead of losing it:
//!
//! - **Processing to control**: the listener is flagged as overflowed and the
//!   next control drain sweeps every registry for flagged listeners.
//! - **Control to processing**: the listener is parked in a control-side
//!   backlog that every control drain retries into the queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::config::StateConfig;
use crate::scoped_callback::ListenerId;
use crate::thread::{CallbackThread, is_processing_thread};

/// Fixed callback signature for every listener.
pub type Callback = Box<dyn Fn() + Send + Sync>;

/// One registered listener.
pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) thread: CallbackThread,
    callback: Callback,
    /// Cleared on deregistration; queued deliveries check it before calling.
    active: AtomicBool,
    /// Set while a delivery for this entry is owed.
    pending: AtomicBool,
    /// Set when the owed delivery missed a full control queue.
    overflowed: AtomicBool,
}

impl ListenerEntry {
    pub(crate) fn new(id: ListenerId, thread: CallbackThread, callback: Callback) -> Self {
        Self {
            id,
            thread,
            callback,
            active: AtomicBool::new(true),
            pending: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn invoke(&self) {
        (self.callback)();
    }

    /// Clear the owed delivery and run it if still registered.
    fn deliver(&self) -> bool {
        self.pending.store(false, Ordering::Release);
        if self.is_active() {
            self.invoke();
            true
        } else {
            false
        }
    }
}

/// Something holding listener entries that the control drain can sweep.
pub(crate) trait ListenerSource: Send + Sync {
    fn visit(&self, f: &mut dyn FnMut(&Arc<ListenerEntry>));
}

struct Lane {
    tx: Sender<Arc<ListenerEntry>>,
    rx: Receiver<Arc<ListenerEntry>>,
    overflowed: AtomicUsize,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            overflowed: AtomicUsize::new(0),
        }
    }

    /// Runs every delivery queued before the call. Deliveries queued by the
    /// callbacks themselves wait for the next drain.
    fn drain(&self) -> usize {
        let budget = self.rx.len();
        let mut delivered = 0;
        for _ in 0..budget {
            let Ok(entry) = self.rx.try_recv() else {
                break;
            };
            if entry.deliver() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Pre-sized queues carrying notifications between the two contexts.
///
/// Shared by every broadcaster of one plugin state instance.
pub struct Dispatcher {
    to_control: Lane,
    to_processing: Lane,
    /// Registries bound to this dispatcher, swept after a control overflow.
    sources: Mutex<Vec<Weak<dyn ListenerSource>>>,
    sweep_needed: AtomicBool,
    /// Processing-bound deliveries waiting for room in the queue.
    backlog: Mutex<Vec<Arc<ListenerEntry>>>,
    reported: AtomicUsize,
}

impl Dispatcher {
    /// Create a dispatcher with explicit queue capacities.
    pub fn new(control_capacity: usize, processing_capacity: usize) -> Self {
        Self {
            to_control: Lane::new(control_capacity),
            to_processing: Lane::new(processing_capacity),
            sources: Mutex::new(Vec::new()),
            sweep_needed: AtomicBool::new(false),
            backlog: Mutex::new(Vec::new()),
            reported: AtomicUsize::new(0),
        }
    }

    /// Create a dispatcher sized from a [`StateConfig`].
    pub fn from_config(config: &StateConfig) -> Self {
        Self::new(
            config.control_queue_capacity,
            config.processing_queue_capacity,
        )
    }

    fn lane(&self, thread: CallbackThread) -> &Lane {
        match thread {
            CallbackThread::Control => &self.to_control,
            CallbackThread::Processing => &self.to_processing,
        }
    }

    /// Register a listener registry for overflow sweeps. Control thread only.
    pub(crate) fn track(&self, source: Weak<dyn ListenerSource>) {
        let mut sources = self.sources.lock();
        sources.retain(|s| s.strong_count() > 0);
        sources.push(source);
    }

    /// Queue a delivery for `entry` on its target thread.
    ///
    /// A coalesced delivery returns immediately. When the queue is full the
    /// delivery stays owed: from the processing thread this only sets flags,
    /// from the control thread the entry joins the backlog.
    pub(crate) fn enqueue(&self, entry: &Arc<ListenerEntry>) {
        if entry.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let lane = self.lane(entry.thread);
        let entry = match lane.tx.try_send(Arc::clone(entry)) {
            Ok(()) => return,
            Err(err) => err.into_inner(),
        };
        lane.overflowed.fetch_add(1, Ordering::Relaxed);
        match entry.thread {
            CallbackThread::Control => {
                entry.overflowed.store(true, Ordering::Release);
                self.sweep_needed.store(true, Ordering::Release);
            }
            CallbackThread::Processing => {
                debug_assert!(!is_processing_thread());
                self.backlog.lock().push(entry);
            }
        }
    }

    /// Deliver pending control-thread notifications.
    ///
    /// Call from the control thread, e.g. once per UI frame. Also delivers
    /// anything that missed a full queue and retries the processing backlog.
    /// Returns the number of callbacks invoked.
    pub fn dispatch_control(&self) -> usize {
        debug_assert!(
            !is_processing_thread(),
            "dispatch_control called from the processing thread"
        );
        let mut delivered = self.to_control.drain();
        if self.sweep_needed.swap(false, Ordering::AcqRel) {
            delivered += self.sweep_overflowed();
        }
        self.flush_backlog();
        self.report_overflow();
        delivered
    }

    /// Deliver pending processing-thread notifications.
    ///
    /// Called at the start of every processing block. Never blocks or
    /// allocates.
    pub fn dispatch_processing(&self) -> usize {
        self.to_processing.drain()
    }

    fn sweep_overflowed(&self) -> usize {
        let live: Vec<Arc<dyn ListenerSource>> = {
            let mut sources = self.sources.lock();
            sources.retain(|s| s.strong_count() > 0);
            sources.iter().filter_map(Weak::upgrade).collect()
        };
        let mut delivered = 0;
        for source in live {
            source.visit(&mut |entry| {
                if entry.overflowed.swap(false, Ordering::AcqRel) && entry.deliver() {
                    delivered += 1;
                }
            });
        }
        delivered
    }

    fn flush_backlog(&self) {
        let mut backlog = self.backlog.lock();
        backlog.retain(|entry| {
            if !entry.is_active() {
                entry.pending.store(false, Ordering::Release);
                return false;
            }
            self.to_processing.tx.try_send(Arc::clone(entry)).is_err()
        });
    }

    /// Number of deliveries waiting for the control thread.
    pub fn pending_control(&self) -> usize {
        self.to_control.rx.len()
    }

    /// Number of deliveries waiting for the processing thread, including
    /// those parked until the queue has room.
    pub fn pending_processing(&self) -> usize {
        self.to_processing.rx.len() + self.backlog.lock().len()
    }

    /// Total deliveries that found their queue full and were deferred.
    pub fn overflowed(&self) -> usize {
        self.to_control.overflowed.load(Ordering::Relaxed)
            + self.to_processing.overflowed.load(Ordering::Relaxed)
    }

    /// Log overflows since the previous report. Returns how many were new.
    fn report_overflow(&self) -> usize {
        let total = self.overflowed();
        let previous = self.reported.swap(total, Ordering::Relaxed);
        let new = total.saturating_sub(previous);
        if new > 0 {
            tracing::warn!(
                new,
                total,
                control_capacity = self.to_control.tx.capacity().unwrap_or(0),
                processing_capacity = self.to_processing.tx.capacity().unwrap_or(0),
                "notification queue full, deliveries deferred; raise the queue capacity in StateConfig"
            );
        }
        new
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::from_config(&StateConfig::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending_control", &self.pending_control())
            .field("pending_processing", &self.pending_processing())
            .field("overflowed", &self.overflowed())
            .finish()
    }
}
