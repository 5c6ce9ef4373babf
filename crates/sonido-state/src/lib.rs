//! Live plugin state for the sonido framework.
//!
//! This crate holds the state of a plugin instance while it runs: host
//! automatable parameters, non-parameter state values, listeners that react to
//! changes on either the processing (audio) thread or the control (UI/message)
//! thread, and a versioned JSON snapshot for save, load and undo.
//!
//! # Features
//!
//! - **Parameters**: lock-free `f32` atomics with float, bool and choice kinds
//! - **State Values**: typed `f64`/`i64`/`bool`/`String` leaves with change broadcasting
//! - **Listeners**: RAII [`ScopedCallback`] handles, delivered inline on the
//!   firing thread or handed across through pre-sized queues
//! - **Per-block Change Detection**: parameter listeners fire once per block
//! - **Persistence**: identity-keyed JSON, tolerant of unknown and missing entries
//! - **Undo**: optional external [`UndoManager`] receives one transaction per edit
//!
//! # Threading Model
//!
//! The processing thread calls [`PluginState::process_block`] at the start of
//! each block and never blocks, locks or allocates there. The control thread
//! registers listeners, calls [`PluginState::dispatch_control`] once per UI
//! frame, and saves or loads state.
//!
//! # Example
//!
//! ```rust
//! use sonido_state::{
//!     CallbackThread, ParamHolder, Parameter, PluginState, StateConfig, StateValue,
//! };
//! use std::sync::Arc;
//!
//! let mut holder = ParamHolder::new("root");
//! let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
//! let theme = holder.add_value(StateValue::new("theme", String::from("dark")));
//!
//! let mut state = PluginState::new(StateConfig::default().with_app_version("1.0.0"));
//! state.initialise(Arc::new(holder), None, None).unwrap();
//!
//! let _on_gain = state
//!     .add_parameter_listener(&gain, CallbackThread::Control, || println!("gain moved"))
//!     .unwrap();
//! let _on_theme = state
//!     .add_non_parameter_listener(&theme, CallbackThread::Control, || println!("theme"))
//!     .unwrap();
//!
//! gain.set(-6.0);
//! state.process_block().unwrap();
//! state.dispatch_control().unwrap();
//!
//! let saved = state.serialize().unwrap();
//! let report = state.deserialize(&saved).unwrap();
//! assert!(report.is_clean());
//! ```

mod broadcaster;
mod config;
mod dispatch;
mod error;
mod format;
mod holder;
mod host;
mod listeners;
mod param;
mod plugin_state;
mod scoped_callback;
mod state_value;
mod thread;
mod undo;

pub use broadcaster::ChangeBroadcaster;
pub use config::{DEFAULT_QUEUE_CAPACITY, StateConfig};
pub use dispatch::{Callback, Dispatcher};
pub use error::StateError;
pub use format::{DocumentError, FORMAT_VERSION, LEGACY_FORMAT_VERSION, LoadReport, StateDocument};
pub use holder::{ParamHolder, StateNode};
pub use host::HostProcessor;
pub use listeners::ParameterListeners;
pub use param::{ParamKind, Parameter};
pub use plugin_state::PluginState;
pub use scoped_callback::{ListenerId, ScopedCallback};
pub use state_value::{StateType, StateValue, StateValueRef};
pub use thread::{CallbackThread, ProcessingScope, is_processing_thread};
pub use undo::{UndoAction, UndoManager};
