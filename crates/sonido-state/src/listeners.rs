//! Per-parameter change notification.
//!
//! Parameters are plain atomics written by the host, so nothing fires when
//! they change. [`ParameterListeners`] closes that gap: once per processing
//! block, [`process_block`](ParameterListeners::process_block) compares every
//! parameter with the value it saw last block and fires that parameter's
//! broadcaster once if it moved.
//!
//! ```text
//! host automation ─► Parameter (AtomicU32)
//!                          │
//!            process_block │ compare with last-seen bits
//!                          ▼
//!                 ChangeBroadcaster::fire()
//!                    │                 │
//!        Processing listeners    Control listeners
//!          (called inline)     (queued → dispatch_control)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::broadcaster::ChangeBroadcaster;
use crate::dispatch::Dispatcher;
use crate::error::StateError;
use crate::holder::ParamHolder;
use crate::param::Parameter;
use crate::scoped_callback::ScopedCallback;
use crate::thread::{CallbackThread, ProcessingScope, is_processing_thread};

/// Change detection and listener registries for every parameter in a tree.
pub struct ParameterListeners {
    params: Box<[Arc<Parameter>]>,
    last_seen: Box<[AtomicU32]>,
    broadcasters: Box<[ChangeBroadcaster]>,
    index: HashMap<String, usize>,
    dispatcher: Arc<Dispatcher>,
}

impl ParameterListeners {
    /// Build listeners for every parameter in `holder`.
    ///
    /// The last-seen snapshot starts at each parameter's current value, so the
    /// first block only reports changes made after construction.
    pub fn new(holder: &ParamHolder, dispatcher: Arc<Dispatcher>) -> Self {
        let params: Box<[Arc<Parameter>]> = holder.parameters().into_boxed_slice();
        let last_seen = params.iter().map(|p| AtomicU32::new(p.raw_bits())).collect();
        let broadcasters = params
            .iter()
            .map(|_| ChangeBroadcaster::with_dispatcher(Arc::clone(&dispatcher)))
            .collect();
        let index = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id().to_string(), i))
            .collect();
        Self {
            params,
            last_seen,
            broadcasters,
            index,
            dispatcher,
        }
    }

    /// Number of tracked parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters are tracked.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn position(&self, param: &Parameter) -> Result<usize, StateError> {
        self.index
            .get(param.id())
            .copied()
            .filter(|&i| std::ptr::eq(Arc::as_ptr(&self.params[i]), param))
            .ok_or_else(|| StateError::UnknownParameter(param.id().to_string()))
    }

    fn position_by_id(&self, id: &str) -> Result<usize, StateError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| StateError::UnknownParameter(id.to_string()))
    }

    /// Register `callback` for changes to `param`.
    ///
    /// `param` must be the instance held by the tree, not merely one with the
    /// same identity.
    pub fn add_parameter_listener<F>(
        &self,
        param: &Parameter,
        thread: CallbackThread,
        callback: F,
    ) -> Result<ScopedCallback, StateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let i = self.position(param)?;
        Ok(self.broadcasters[i].connect(thread, callback))
    }

    /// Register `callback` for changes to the parameter with identity `id`.
    pub fn add_listener_by_id<F>(
        &self,
        id: &str,
        thread: CallbackThread,
        callback: F,
    ) -> Result<ScopedCallback, StateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let i = self.position_by_id(id)?;
        Ok(self.broadcasters[i].connect(thread, callback))
    }

    /// Broadcaster of the parameter with identity `id`.
    pub fn broadcaster(&self, id: &str) -> Option<&ChangeBroadcaster> {
        self.index.get(id).map(|&i| &self.broadcasters[i])
    }

    /// Per-block advance. Call once at the start of every processing block.
    ///
    /// Delivers queued processing-thread notifications, then fires the
    /// broadcaster of every parameter whose value changed since the previous
    /// block. Returns the number of changed parameters.
    ///
    /// Lock-free and allocation-free.
    pub fn process_block(&self) -> usize {
        let _scope = ProcessingScope::enter();
        self.dispatcher.dispatch_processing();

        let mut changed = 0;
        for ((param, last), broadcaster) in self
            .params
            .iter()
            .zip(self.last_seen.iter())
            .zip(self.broadcasters.iter())
        {
            let bits = param.raw_bits();
            if last.swap(bits, Ordering::AcqRel) != bits {
                broadcaster.fire();
                changed += 1;
            }
        }
        changed
    }

    /// Report a control-side change to `param` immediately.
    ///
    /// Claims the change through the same last-seen swap the advance uses:
    /// whichever side swaps in the new bits first fires, the other sees
    /// nothing new. Returns whether this call fired.
    pub(crate) fn publish_change(&self, param: &Parameter) -> bool {
        debug_assert!(!is_processing_thread());
        let Ok(i) = self.position(param) else {
            return false;
        };
        let bits = param.raw_bits();
        if self.last_seen[i].swap(bits, Ordering::AcqRel) == bits {
            return false;
        }
        self.broadcasters[i].fire();
        true
    }

    /// Deliver pending control-thread notifications and release retired
    /// listener snapshots. Call from the control thread.
    pub fn dispatch_control(&self) -> usize {
        let delivered = self.dispatcher.dispatch_control();
        for broadcaster in &*self.broadcasters {
            broadcaster.release_retired();
        }
        delivered
    }

    /// Total registered listeners across all parameters.
    pub fn listener_count(&self) -> usize {
        self.broadcasters.iter().map(ChangeBroadcaster::listener_count).sum()
    }
}

impl std::fmt::Debug for ParameterListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterListeners")
            .field("params", &self.params.len())
            .field("listeners", &self.listener_count())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ParamHolder, Arc<Parameter>, Arc<Parameter>) {
        let mut holder = ParamHolder::new("root");
        let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
        let mix = holder.add_param(Parameter::float("mix", "Mix", 0.0, 100.0, 50.0));
        (holder, gain, mix)
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn no_change_no_fire() {
        let (holder, gain, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (count, cb) = counter();
        let _h = listeners
            .add_parameter_listener(&gain, CallbackThread::Processing, cb)
            .unwrap();

        assert_eq!(listeners.process_block(), 0);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn many_writes_fire_once_per_block() {
        let (holder, gain, mix) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (gain_count, cb) = counter();
        let _h = listeners
            .add_parameter_listener(&gain, CallbackThread::Processing, cb)
            .unwrap();

        gain.set(-1.0);
        gain.set(-2.0);
        gain.set(-3.0);
        assert_eq!(listeners.process_block(), 1);
        assert_eq!(gain_count.load(Ordering::Relaxed), 1);

        mix.set(10.0);
        assert_eq!(listeners.process_block(), 1);
        assert_eq!(gain_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn control_listener_waits_for_drain() {
        let (holder, gain, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (count, cb) = counter();
        let _h = listeners
            .add_parameter_listener(&gain, CallbackThread::Control, cb)
            .unwrap();

        gain.set(-6.0);
        listeners.process_block();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(listeners.dispatch_control(), 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_parameter_rejected() {
        let (holder, _, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let stranger = Parameter::float("gain", "Gain", -60.0, 12.0, 0.0);

        let err = listeners
            .add_parameter_listener(&stranger, CallbackThread::Control, || {})
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownParameter(_)));

        let err = listeners
            .add_listener_by_id("drive", CallbackThread::Control, || {})
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownParameter(ref id) if id == "drive"));
    }

    #[test]
    fn published_change_is_not_reported_again() {
        let (holder, gain, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (count, cb) = counter();
        let _h = listeners
            .add_listener_by_id("gain", CallbackThread::Control, cb)
            .unwrap();

        gain.set(-3.0);
        listeners.publish_change(&gain);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(listeners.process_block(), 0);
        listeners.dispatch_control();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn change_seen_by_block_is_not_published_again() {
        let (holder, gain, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (count, cb) = counter();
        let _h = listeners
            .add_parameter_listener(&gain, CallbackThread::Processing, cb)
            .unwrap();

        // The block runs between the write and the control-side publish.
        gain.set(-3.0);
        assert_eq!(listeners.process_block(), 1);
        assert!(!listeners.publish_change(&gain));
        listeners.process_block();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn released_listener_not_called() {
        let (holder, gain, _) = setup();
        let listeners = ParameterListeners::new(&holder, Arc::new(Dispatcher::new(8, 8)));
        let (count, cb) = counter();
        let handle = listeners
            .add_parameter_listener(&gain, CallbackThread::Control, cb)
            .unwrap();

        gain.set(-6.0);
        listeners.process_block();
        drop(handle);
        listeners.dispatch_control();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(listeners.listener_count(), 0);
    }
}
