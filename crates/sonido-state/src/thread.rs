//! Execution-context tagging.
//!
//! Every listener is registered for one of two contexts: the real-time
//! processing thread or the control (message/UI) thread. A thread counts as the
//! processing context while it holds a [`ProcessingScope`]; every other thread
//! is the control context.
//!
//! The marker is a `const`-initialized thread-local counter, so entering and
//! querying the scope never allocates.

use std::cell::Cell;

thread_local! {
    static PROCESSING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The context a listener callback is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackThread {
    /// Real-time processing thread. Callbacks run inline during
    /// [`ParameterListeners::process_block`](crate::ParameterListeners::process_block)
    /// or a processing-thread `fire()`.
    Processing,
    /// Control / message thread. Callbacks run when the control thread drains
    /// pending notifications.
    Control,
}

impl CallbackThread {
    /// The context of the calling thread.
    #[inline]
    pub fn current() -> Self {
        if PROCESSING_DEPTH.with(Cell::get) > 0 {
            Self::Processing
        } else {
            Self::Control
        }
    }

    /// The other context.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Self::Processing => Self::Control,
            Self::Control => Self::Processing,
        }
    }
}

/// Returns `true` if the calling thread is inside a [`ProcessingScope`].
#[inline]
pub fn is_processing_thread() -> bool {
    CallbackThread::current() == CallbackThread::Processing
}

/// RAII marker for the processing context.
///
/// Hosts enter the scope at the top of their audio callback so that state
/// mutations made there are tagged as processing-thread changes. Scopes nest.
///
/// ```rust
/// use sonido_state::{CallbackThread, ProcessingScope};
///
/// assert_eq!(CallbackThread::current(), CallbackThread::Control);
/// {
///     let _scope = ProcessingScope::enter();
///     assert_eq!(CallbackThread::current(), CallbackThread::Processing);
/// }
/// assert_eq!(CallbackThread::current(), CallbackThread::Control);
/// ```
#[must_use = "the processing scope ends when the guard is dropped"]
pub struct ProcessingScope {
    // Thread-local state: the guard must be dropped on the thread that made it.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ProcessingScope {
    /// Marks the calling thread as the processing context.
    #[inline]
    pub fn enter() -> Self {
        PROCESSING_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for ProcessingScope {
    #[inline]
    fn drop(&mut self) {
        PROCESSING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
