//! Top-level plugin state.
//!
//! [`PluginState`] ties a finished [`ParamHolder`] to the notification
//! machinery, the host and an optional undo manager. It is built in two
//! phases: [`PluginState::new`] creates an empty shell, and
//! [`initialise`](PluginState::initialise) wires it to the tree exactly once.
//!
//! ```rust
//! use sonido_state::{CallbackThread, ParamHolder, Parameter, PluginState, StateConfig};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! let mut holder = ParamHolder::new("root");
//! let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
//!
//! let mut state = PluginState::new(StateConfig::default());
//! state.initialise(Arc::new(holder), None, None).unwrap();
//!
//! let hits = Arc::new(AtomicU32::new(0));
//! let h = Arc::clone(&hits);
//! let _listener = state
//!     .add_parameter_listener(&gain, CallbackThread::Control, move || {
//!         h.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .unwrap();
//!
//! gain.set(-6.0); // host automation
//! state.process_block().unwrap(); // audio thread, start of block
//! state.dispatch_control().unwrap(); // UI thread, once per frame
//! assert_eq!(hits.load(Ordering::Relaxed), 1);
//!
//! let saved = state.serialize().unwrap();
//! gain.set(0.0);
//! state.deserialize(&saved).unwrap();
//! assert_eq!(gain.get(), -6.0);
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::StateConfig;
use crate::dispatch::Dispatcher;
use crate::error::StateError;
use crate::format::{FORMAT_VERSION, LoadReport, StateDocument};
use crate::holder::{Leaf, LeafChange, ParamHolder, TreeLoad};
use crate::host::HostProcessor;
use crate::listeners::ParameterListeners;
use crate::param::Parameter;
use crate::scoped_callback::ScopedCallback;
use crate::state_value::{StateType, StateValue};
use crate::thread::{CallbackThread, is_processing_thread};
use crate::undo::{UndoAction, UndoManager, record_transaction};

/// Everything `initialise` wires together.
struct Bound {
    holder: Arc<ParamHolder>,
    listeners: Arc<ParameterListeners>,
    dispatcher: Arc<Dispatcher>,
    undo: Option<Weak<dyn UndoManager>>,
}

impl Bound {
    fn undo_manager(&self) -> Option<Arc<dyn UndoManager>> {
        self.undo.as_ref().and_then(Weak::upgrade)
    }
}

/// Live plugin state: parameters, state values, listeners and persistence.
///
/// Share it between threads behind an `Arc` once initialised. The processing
/// thread calls [`process_block`](Self::process_block); the control thread
/// calls everything else.
pub struct PluginState {
    config: StateConfig,
    bound: Option<Bound>,
    snapshot: Mutex<()>,
}

impl PluginState {
    /// Create an uninitialised state.
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            bound: None,
            snapshot: Mutex::new(()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Whether `initialise` has succeeded.
    pub fn is_initialised(&self) -> bool {
        self.bound.is_some()
    }

    fn bound(&self) -> Result<&Bound, StateError> {
        self.bound.as_ref().ok_or(StateError::NotInitialised)
    }

    /// Wire the state to its tree. Call exactly once, on the control thread.
    ///
    /// Validates identities, binds every state value to this state's
    /// dispatcher and undo manager, builds the per-parameter listeners and
    /// finally hands the tree to `host`.
    ///
    /// The undo manager is borrowed: only a `Weak` reference is kept, and
    /// recording stops silently once the manager is dropped.
    pub fn initialise(
        &mut self,
        holder: Arc<ParamHolder>,
        host: Option<&mut dyn HostProcessor>,
        undo: Option<&Arc<dyn UndoManager>>,
    ) -> Result<(), StateError> {
        if self.bound.is_some() {
            return Err(StateError::AlreadyInitialised);
        }
        self.config.validate()?;
        holder.validate()?;

        let dispatcher = Arc::new(Dispatcher::from_config(&self.config));
        let undo = undo.map(Arc::downgrade);
        holder.for_each_value(&mut |value| {
            value.bind(&dispatcher, undo.as_ref());
        });
        let listeners = Arc::new(ParameterListeners::new(&holder, Arc::clone(&dispatcher)));

        if let Some(host) = host {
            host.bind_parameters(&holder);
        }

        tracing::info!(
            params = holder.param_count(),
            values = holder.value_count(),
            undo = undo.is_some(),
            "plugin state initialised"
        );

        self.bound = Some(Bound {
            holder,
            listeners,
            dispatcher,
            undo,
        });
        Ok(())
    }

    /// The state tree.
    pub fn holder(&self) -> Result<&Arc<ParamHolder>, StateError> {
        Ok(&self.bound()?.holder)
    }

    /// The dispatcher shared by every broadcaster of this state.
    pub fn dispatcher(&self) -> Result<&Arc<Dispatcher>, StateError> {
        Ok(&self.bound()?.dispatcher)
    }

    /// Per-parameter change detection and listener registries.
    pub fn parameter_listeners(&self) -> Result<&ParameterListeners, StateError> {
        Ok(&self.bound()?.listeners)
    }

    /// Register `callback` for changes to `param`.
    pub fn add_parameter_listener<F>(
        &self,
        param: &Parameter,
        thread: CallbackThread,
        callback: F,
    ) -> Result<ScopedCallback, StateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.bound()?
            .listeners
            .add_parameter_listener(param, thread, callback)
    }

    /// Register `callback` for changes to the parameter with identity `id`.
    pub fn add_parameter_listener_by_id<F>(
        &self,
        id: &str,
        thread: CallbackThread,
        callback: F,
    ) -> Result<ScopedCallback, StateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.bound()?.listeners.add_listener_by_id(id, thread, callback)
    }

    /// Register `callback` for changes to a state value of this tree.
    pub fn add_non_parameter_listener<T, F>(
        &self,
        value: &StateValue<T>,
        thread: CallbackThread,
        callback: F,
    ) -> Result<ScopedCallback, StateError>
    where
        T: StateType,
        F: Fn() + Send + Sync + 'static,
    {
        let bound = self.bound()?;
        let known = bound
            .holder
            .find_value(value.id())
            .is_some_and(|r| r.is(value));
        if !known {
            return Err(StateError::UnknownStateValue(value.id().to_string()));
        }
        Ok(value.broadcaster().connect(thread, callback))
    }

    /// Per-block advance, called at the start of every processing block.
    ///
    /// Returns the number of parameters that changed since the last block.
    /// See [`ParameterListeners::process_block`].
    pub fn process_block(&self) -> Result<usize, StateError> {
        Ok(self.bound()?.listeners.process_block())
    }

    /// Deliver pending control-thread notifications and release retired
    /// listener snapshots. Call periodically from the control thread.
    pub fn dispatch_control(&self) -> Result<usize, StateError> {
        let bound = self.bound()?;
        let delivered = bound.listeners.dispatch_control();
        bound
            .holder
            .for_each_value(&mut |value| value.broadcaster().release_retired());
        Ok(delivered)
    }

    /// Set a parameter from the control thread.
    ///
    /// Unlike a host write straight to the [`Parameter`], listeners are
    /// notified now and the change is recorded for undo when
    /// [`StateConfig::undo_parameter_changes`] is set. Returns whether the
    /// value changed.
    pub fn set_parameter(&self, id: &str, value: f32) -> Result<bool, StateError> {
        let bound = self.bound()?;
        let param = bound
            .holder
            .find_parameter(id)
            .ok_or_else(|| StateError::UnknownParameter(id.to_string()))?;

        let before = param.get();
        param.set(value);
        let after = param.get();
        if before.to_bits() == after.to_bits() {
            return Ok(false);
        }
        bound.listeners.publish_change(param);

        if self.config.undo_parameter_changes
            && let Some(manager) = bound.undo_manager()
        {
            let listeners = Arc::downgrade(&bound.listeners);
            let action = UndoAction::new(
                format!("Set {id}"),
                replay_parameter(Arc::clone(param), before, listeners.clone()),
                replay_parameter(Arc::clone(param), after, listeners),
            );
            record_transaction(manager.as_ref(), action);
        }
        Ok(true)
    }

    /// Current state as a document.
    pub fn snapshot(&self) -> Result<StateDocument, StateError> {
        let bound = self.bound()?;
        let _guard = self.snapshot.lock();
        Ok(StateDocument::new(
            bound.holder.to_json(),
            self.config.app_version.clone(),
        ))
    }

    /// Encode every parameter and state value.
    ///
    /// Concurrent calls are serialized; each produces a complete snapshot.
    pub fn serialize(&self) -> Result<Vec<u8>, StateError> {
        let bytes = self.snapshot()?.to_vec()?;
        tracing::debug!(bytes = bytes.len(), "state serialized");
        Ok(bytes)
    }

    /// Restore state from `data`.
    ///
    /// Entries are matched by identity. Unknown entries are ignored, absent
    /// ones keep their value and entries with an unusable payload are skipped.
    /// Every leaf that actually changed notifies its listeners once. Bad data
    /// never produces an error; see the returned [`LoadReport`].
    pub fn deserialize(&self, data: &[u8]) -> Result<LoadReport, StateError> {
        let bound = self.bound()?;
        debug_assert!(
            !is_processing_thread(),
            "deserialize called from the processing thread"
        );
        let _guard = self.snapshot.lock();

        let doc = match StateDocument::from_slice(data) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, bytes = data.len(), "ignoring unreadable state");
                return Ok(LoadReport {
                    malformed: Some(e.to_string()),
                    ..LoadReport::default()
                });
            }
        };
        if doc.format_version > FORMAT_VERSION {
            tracing::warn!(
                found = doc.format_version,
                supported = FORMAT_VERSION,
                "state written by a newer format; loading recognised entries only"
            );
        }

        let mut load = TreeLoad::default();
        bound.holder.apply_json(&doc.tree, "", &mut load);
        for change in &load.changed {
            if let Leaf::Param(param) = &change.leaf {
                bound.listeners.publish_change(param);
            }
        }

        for key in &load.ignored {
            tracing::debug!(key = %key, "ignoring unknown state entry");
        }
        for key in &load.rejected {
            tracing::warn!(key = %key, "skipping state entry with unusable payload");
        }

        let report = LoadReport {
            legacy_layout: doc.is_legacy(),
            format_version: Some(doc.format_version),
            app_version: doc.app_version,
            applied: load.changed.len(),
            unchanged: load.unchanged,
            missing: load.missing,
            ignored: load.ignored,
            rejected: load.rejected,
            malformed: None,
        };
        tracing::info!(
            applied = report.applied,
            ignored = report.ignored.len(),
            rejected = report.rejected.len(),
            legacy = report.legacy_layout,
            "state loaded"
        );

        if !load.changed.is_empty()
            && let Some(manager) = bound.undo_manager()
        {
            let changes = Arc::new(load.changed);
            let listeners = Arc::downgrade(&bound.listeners);
            let action = UndoAction::new(
                "Load state",
                replay_changes(Arc::clone(&changes), listeners.clone(), false),
                replay_changes(changes, listeners, true),
            );
            record_transaction(manager.as_ref(), action);
        }
        Ok(report)
    }
}

fn replay_parameter(
    param: Arc<Parameter>,
    value: f32,
    listeners: Weak<ParameterListeners>,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        param.set(value);
        if let Some(listeners) = listeners.upgrade() {
            listeners.publish_change(&param);
        }
    }
}

fn replay_changes(
    changes: Arc<Vec<LeafChange>>,
    listeners: Weak<ParameterListeners>,
    forward: bool,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        let listeners = listeners.upgrade();
        for change in changes.iter() {
            let value = if forward { &change.after } else { &change.before };
            if change.leaf.restore(value)
                && let Leaf::Param(param) = &change.leaf
                && let Some(listeners) = &listeners
            {
                listeners.publish_change(param);
            }
        }
    }
}

impl Default for PluginState {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

impl std::fmt::Debug for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("PluginState");
        s.field("config", &self.config)
            .field("initialised", &self.is_initialised());
        if let Some(bound) = &self.bound {
            s.field("params", &bound.listeners.len())
                .field("values", &bound.holder.value_count());
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Undo {
        names: Mutex<Vec<String>>,
        actions: Mutex<Vec<UndoAction>>,
    }

    impl UndoManager for Undo {
        fn begin_transaction(&self, name: &str) {
            self.names.lock().push(name.to_string());
        }
        fn record(&self, action: UndoAction) {
            self.actions.lock().push(action);
        }
        fn commit_transaction(&self) {}
    }

    struct Host {
        bound: Vec<String>,
    }

    impl HostProcessor for Host {
        fn bind_parameters(&mut self, holder: &ParamHolder) {
            holder.for_each_parameter(&mut |p| self.bound.push(p.id().to_string()));
        }
    }

    fn tree() -> (Arc<ParamHolder>, Arc<Parameter>, Arc<StateValue<bool>>) {
        let mut holder = ParamHolder::new("root");
        let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
        let meters = holder.add_value(StateValue::new("showMeters", false));
        (Arc::new(holder), gain, meters)
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn use_before_initialise_is_an_error() {
        let state = PluginState::default();
        let (_, gain, _) = tree();
        assert!(matches!(state.serialize(), Err(StateError::NotInitialised)));
        assert!(matches!(state.deserialize(b"{}"), Err(StateError::NotInitialised)));
        assert!(matches!(state.process_block(), Err(StateError::NotInitialised)));
        assert!(matches!(
            state.add_parameter_listener(&gain, CallbackThread::Control, || {}),
            Err(StateError::NotInitialised)
        ));
    }

    #[test]
    fn double_initialise_is_an_error() {
        let (holder, _, _) = tree();
        let mut state = PluginState::default();
        state.initialise(Arc::clone(&holder), None, None).unwrap();
        assert!(matches!(
            state.initialise(holder, None, None),
            Err(StateError::AlreadyInitialised)
        ));
    }

    #[test]
    fn duplicate_identity_fails_initialise() {
        let mut holder = ParamHolder::new("root");
        holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
        holder.add_value(StateValue::new("gain", 1.0_f64));
        let mut state = PluginState::default();
        let err = state.initialise(Arc::new(holder), None, None).unwrap_err();
        assert!(matches!(err, StateError::DuplicateIdentity(_)));
        assert!(!state.is_initialised());
    }

    #[test]
    fn host_receives_parameters() {
        let (holder, _, _) = tree();
        let mut host = Host { bound: Vec::new() };
        let mut state = PluginState::default();
        state.initialise(holder, Some(&mut host), None).unwrap();
        assert_eq!(host.bound, ["gain"]);
    }

    #[test]
    fn foreign_state_value_rejected() {
        let (holder, _, meters) = tree();
        let mut state = PluginState::default();
        state.initialise(holder, None, None).unwrap();

        let stranger = StateValue::new("showMeters", false);
        let err = state
            .add_non_parameter_listener(&stranger, CallbackThread::Control, || {})
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownStateValue(_)));
        assert!(
            state
                .add_non_parameter_listener(&meters, CallbackThread::Control, || {})
                .is_ok()
        );
    }

    #[test]
    fn set_parameter_notifies_and_records_undo() {
        let (holder, gain, _) = tree();
        let undo = Arc::new(Undo::default());
        let manager: Arc<dyn UndoManager> = undo.clone();
        let mut state = PluginState::default();
        state.initialise(holder, None, Some(&manager)).unwrap();

        let (count, cb) = counter();
        let _h = state
            .add_parameter_listener(&gain, CallbackThread::Control, cb)
            .unwrap();

        assert!(state.set_parameter("gain", -12.0).unwrap());
        assert!(!state.set_parameter("gain", -12.0).unwrap());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(state.process_block().unwrap(), 0);
        assert_eq!(*undo.names.lock(), vec!["Set gain"]);

        undo.actions.lock()[0].undo();
        assert_eq!(gain.get(), 0.0);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn set_parameter_without_undo_flag() {
        let (holder, _, _) = tree();
        let undo = Arc::new(Undo::default());
        let manager: Arc<dyn UndoManager> = undo.clone();
        let config = StateConfig {
            undo_parameter_changes: false,
            ..StateConfig::default()
        };
        let mut state = PluginState::new(config);
        state.initialise(holder, None, Some(&manager)).unwrap();

        state.set_parameter("gain", 3.0).unwrap();
        assert!(undo.names.lock().is_empty());
        assert!(matches!(
            state.set_parameter("drive", 1.0),
            Err(StateError::UnknownParameter(_))
        ));
    }

    #[test]
    fn state_value_undo_bound_at_initialise() {
        let (holder, _, meters) = tree();
        let undo = Arc::new(Undo::default());
        let manager: Arc<dyn UndoManager> = undo.clone();
        let mut state = PluginState::default();
        state.initialise(holder, None, Some(&manager)).unwrap();

        meters.set(true);
        assert_eq!(*undo.names.lock(), vec!["Set showMeters"]);
    }

    #[test]
    fn load_is_one_undo_transaction() {
        let (holder, gain, meters) = tree();
        let undo = Arc::new(Undo::default());
        let manager: Arc<dyn UndoManager> = undo.clone();
        let mut state = PluginState::default();
        state.initialise(holder, None, Some(&manager)).unwrap();

        state
            .deserialize(br#"{"format_version":1,"tree":{"gain":-9.0,"showMeters":true}}"#)
            .unwrap();
        assert_eq!(*undo.names.lock(), vec!["Load state"]);

        undo.actions.lock()[0].undo();
        assert_eq!(gain.get(), 0.0);
        assert!(!meters.get());
        undo.actions.lock()[0].redo();
        assert_eq!(gain.get(), -9.0);
        assert!(meters.get());
        assert_eq!(undo.names.lock().len(), 1);
    }

    #[test]
    fn unchanged_load_records_nothing() {
        let (holder, _, _) = tree();
        let undo = Arc::new(Undo::default());
        let manager: Arc<dyn UndoManager> = undo.clone();
        let mut state = PluginState::default();
        state.initialise(holder, None, Some(&manager)).unwrap();

        let saved = state.serialize().unwrap();
        let report = state.deserialize(&saved).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.unchanged, 2);
        assert!(undo.names.lock().is_empty());
    }

    #[test]
    fn dropped_undo_manager_is_tolerated() {
        let (holder, _, _) = tree();
        let manager: Arc<dyn UndoManager> = Arc::new(Undo::default());
        let mut state = PluginState::default();
        state.initialise(holder, None, Some(&manager)).unwrap();
        drop(manager);
        assert!(state.set_parameter("gain", -1.0).unwrap());
    }

    #[test]
    fn app_version_written() {
        let (holder, _, _) = tree();
        let mut state = PluginState::new(StateConfig::default().with_app_version("3.1.0"));
        state.initialise(holder, None, None).unwrap();
        let doc = state.snapshot().unwrap();
        assert_eq!(doc.app_version.as_deref(), Some("3.1.0"));
        assert_eq!(doc.format_version, FORMAT_VERSION);
    }
}
