//! Non-parameter state values.
//!
//! A [`StateValue`] is a named, typed leaf of plugin state that the host does
//! not automate: a UI flag, a counter, a mode string. Each owns a
//! [`ChangeBroadcaster`] that fires whenever the value actually changes.
//!
//! The value types form a closed set: `f64`, `i64`, `bool` and `String`.
//! Scalars live in an `AtomicU64`, so reading or writing them from the
//! processing thread is lock-free and allocation-free. Text lives in an
//! `ArcSwap<String>`; writing it allocates.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use serde_json::Value;

use crate::broadcaster::ChangeBroadcaster;
use crate::dispatch::Dispatcher;
use crate::thread::is_processing_thread;
use crate::undo::{UndoAction, UndoManager, record_transaction};

/// Outcome of applying one serialized entry to a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Changed,
    Unchanged,
    Rejected,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for i64 {}
    impl Sealed for bool {}
    impl Sealed for String {}
}

#[doc(hidden)]
pub trait ValueCell<T>: Send + Sync {
    fn new(value: T) -> Self;
    fn load(&self) -> T;
    fn swap(&self, value: T) -> T;
}

#[doc(hidden)]
pub trait ScalarBits: Copy + Send + Sync {
    fn into_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl ScalarBits for f64 {
    fn into_bits(self) -> u64 {
        if self.is_nan() {
            f64::NAN.to_bits()
        } else {
            self.to_bits()
        }
    }
    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

impl ScalarBits for i64 {
    fn into_bits(self) -> u64 {
        u64::from_ne_bytes(self.to_ne_bytes())
    }
    fn from_bits(bits: u64) -> Self {
        i64::from_ne_bytes(bits.to_ne_bytes())
    }
}

impl ScalarBits for bool {
    fn into_bits(self) -> u64 {
        u64::from(self)
    }
    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

#[doc(hidden)]
pub struct ScalarCell<T> {
    bits: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ScalarBits> ValueCell<T> for ScalarCell<T> {
    fn new(value: T) -> Self {
        Self {
            bits: AtomicU64::new(value.into_bits()),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn load(&self) -> T {
        T::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    fn swap(&self, value: T) -> T {
        T::from_bits(self.bits.swap(value.into_bits(), Ordering::AcqRel))
    }
}

#[doc(hidden)]
pub struct TextCell(ArcSwap<String>);

impl ValueCell<String> for TextCell {
    fn new(value: String) -> Self {
        Self(ArcSwap::from_pointee(value))
    }

    fn load(&self) -> String {
        String::clone(&self.0.load())
    }

    fn swap(&self, value: String) -> String {
        let previous = self.0.swap(Arc::new(value));
        Arc::try_unwrap(previous).unwrap_or_else(|shared| String::clone(&shared))
    }
}

/// A type that can be stored in a [`StateValue`].
///
/// Sealed: implemented for `f64`, `i64`, `bool` and `String` only.
pub trait StateType:
    sealed::Sealed + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    /// Short type name used in logs and by the inspector.
    const TYPE_NAME: &'static str;

    #[doc(hidden)]
    type Cell: ValueCell<Self>;

    #[doc(hidden)]
    fn to_json(&self) -> Value;

    #[doc(hidden)]
    fn from_json(value: &Value) -> Option<Self>;

    #[doc(hidden)]
    fn into_ref(value: Arc<StateValue<Self>>) -> StateValueRef;

    /// Whether storing `other` over `self` leaves the stored value unchanged.
    #[doc(hidden)]
    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

// JSON numbers cannot carry these, so they travel as strings.
const NAN_TEXT: &str = "nan";
const INF_TEXT: &str = "inf";
const NEG_INF_TEXT: &str = "-inf";

impl StateType for f64 {
    const TYPE_NAME: &'static str = "float";
    type Cell = ScalarCell<f64>;

    fn to_json(&self) -> Value {
        if self.is_nan() {
            Value::from(NAN_TEXT)
        } else if self.is_infinite() {
            Value::from(if *self > 0.0 { INF_TEXT } else { NEG_INF_TEXT })
        } else {
            Value::from(*self)
        }
    }
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => match text.as_str() {
                NAN_TEXT => Some(f64::NAN),
                INF_TEXT => Some(f64::INFINITY),
                NEG_INF_TEXT => Some(f64::NEG_INFINITY),
                _ => None,
            },
            _ => value.as_f64(),
        }
    }
    fn into_ref(value: Arc<StateValue<Self>>) -> StateValueRef {
        StateValueRef::Float(value)
    }
    // Bitwise: `-0.0` replaces `0.0`, and NaN equals NaN.
    fn same_value(&self, other: &Self) -> bool {
        self.into_bits() == other.into_bits()
    }
}

impl StateType for i64 {
    const TYPE_NAME: &'static str = "int";
    type Cell = ScalarCell<i64>;

    fn to_json(&self) -> Value {
        Value::from(*self)
    }
    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64()
    }
    fn into_ref(value: Arc<StateValue<Self>>) -> StateValueRef {
        StateValueRef::Int(value)
    }
}

impl StateType for bool {
    const TYPE_NAME: &'static str = "bool";
    type Cell = ScalarCell<bool>;

    fn to_json(&self) -> Value {
        Value::Bool(*self)
    }
    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }
    fn into_ref(value: Arc<StateValue<Self>>) -> StateValueRef {
        StateValueRef::Bool(value)
    }
}

impl StateType for String {
    const TYPE_NAME: &'static str = "text";
    type Cell = TextCell;

    fn to_json(&self) -> Value {
        Value::String(self.clone())
    }
    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
    fn into_ref(value: Arc<StateValue<Self>>) -> StateValueRef {
        StateValueRef::Text(value)
    }
}

/// A named, typed, observable piece of non-parameter state.
///
/// Created through [`StateValue::new`], which returns an `Arc` so the builder
/// can keep a typed handle after adding the value to a
/// [`ParamHolder`](crate::ParamHolder).
///
/// # Example
///
/// ```rust
/// use sonido_state::{CallbackThread, StateValue};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// let show_meters = StateValue::new("showMeters", false);
/// let fired = Arc::new(AtomicU32::new(0));
/// let f = Arc::clone(&fired);
/// let _listener = show_meters
///     .broadcaster()
///     .connect(CallbackThread::Control, move || {
///         f.fetch_add(1, Ordering::Relaxed);
///     });
///
/// assert!(show_meters.set(true));
/// assert!(!show_meters.set(true)); // unchanged, no fire
/// assert_eq!(fired.load(Ordering::Relaxed), 1);
/// ```
pub struct StateValue<T: StateType> {
    id: String,
    default: T,
    cell: T::Cell,
    broadcaster: ChangeBroadcaster,
    undo: OnceLock<Weak<dyn UndoManager>>,
    this: Weak<Self>,
}

impl<T: StateType> StateValue<T> {
    /// Create a value holding `default`.
    pub fn new(id: impl Into<String>, default: T) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            id,
            cell: T::Cell::new(default.clone()),
            default,
            broadcaster: ChangeBroadcaster::new(),
            undo: OnceLock::new(),
            this: this.clone(),
        })
    }

    /// Stable identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.cell.load()
    }

    /// Value restored by [`reset`](Self::reset).
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Store `value`. Returns `false` (and fires nothing) if it equals the
    /// current value.
    ///
    /// Listeners are notified before this returns. Off the processing thread,
    /// a bound undo manager receives one transaction.
    pub fn set(&self, value: T) -> bool {
        let Some(previous) = self.store(&value) else {
            return false;
        };
        self.record_undo(previous, value);
        true
    }

    /// Restore the default value.
    pub fn reset(&self) -> bool {
        self.set(self.default.clone())
    }

    /// The broadcaster fired on every change.
    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    /// Type-erased handle to this value.
    pub fn to_ref(self: &Arc<Self>) -> StateValueRef {
        T::into_ref(Arc::clone(self))
    }

    /// Swap in `value` and fire if it differs. Returns the replaced value.
    fn store(&self, value: &T) -> Option<T> {
        let previous = self.cell.swap(value.clone());
        if previous.same_value(value) {
            return None;
        }
        self.broadcaster.fire();
        Some(previous)
    }

    fn record_undo(&self, previous: T, current: T) {
        if is_processing_thread() {
            return;
        }
        let Some(manager) = self.undo.get().and_then(Weak::upgrade) else {
            return;
        };
        let action = UndoAction::new(
            format!("Set {}", self.id),
            self.replay(previous),
            self.replay(current),
        );
        record_transaction(manager.as_ref(), action);
    }

    fn replay(&self, value: T) -> impl Fn() + Send + Sync + 'static {
        let target = self.this.clone();
        move || {
            if let Some(state) = target.upgrade() {
                state.store(&value);
            }
        }
    }

    /// Attach this value to one plugin state. Returns `false` if it was
    /// already attached to another; the first binding is kept.
    pub(crate) fn bind(
        &self,
        dispatcher: &Arc<Dispatcher>,
        undo: Option<&Weak<dyn UndoManager>>,
    ) -> bool {
        let mut bound = self.broadcaster.bind_dispatcher(Arc::clone(dispatcher));
        if let Some(undo) = undo {
            bound &= self.undo.set(undo.clone()).is_ok();
        }
        if !bound {
            tracing::warn!(
                value = %self.id,
                "state value already belongs to another plugin state; keeping its first binding"
            );
        }
        bound
    }

    fn apply_json(&self, value: &Value) -> Applied {
        match T::from_json(value) {
            None => Applied::Rejected,
            Some(v) if self.store(&v).is_some() => Applied::Changed,
            Some(_) => Applied::Unchanged,
        }
    }
}

impl<T: StateType> std::fmt::Debug for StateValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateValue")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("listeners", &self.broadcaster.listener_count())
            .finish()
    }
}

/// Type-erased handle to a [`StateValue`] of any supported type.
#[derive(Debug, Clone)]
pub enum StateValueRef {
    /// `f64` value.
    Float(Arc<StateValue<f64>>),
    /// `i64` value.
    Int(Arc<StateValue<i64>>),
    /// `bool` value.
    Bool(Arc<StateValue<bool>>),
    /// `String` value.
    Text(Arc<StateValue<String>>),
}

macro_rules! with_value {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            StateValueRef::Float($v) => $body,
            StateValueRef::Int($v) => $body,
            StateValueRef::Bool($v) => $body,
            StateValueRef::Text($v) => $body,
        }
    };
}

impl StateValueRef {
    /// Stable identity.
    pub fn id(&self) -> &str {
        with_value!(self, v => v.id())
    }

    /// Name of the stored type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Float(_) => f64::TYPE_NAME,
            Self::Int(_) => i64::TYPE_NAME,
            Self::Bool(_) => bool::TYPE_NAME,
            Self::Text(_) => String::TYPE_NAME,
        }
    }

    /// The broadcaster fired on every change.
    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        with_value!(self, v => v.broadcaster())
    }

    /// Restore the default value.
    pub fn reset(&self) -> bool {
        with_value!(self, v => v.reset())
    }

    /// Serialized form of the current value.
    pub fn to_json(&self) -> Value {
        with_value!(self, v => v.get().to_json())
    }

    /// Whether this handle refers to `value`.
    pub fn is<T: StateType>(&self, value: &StateValue<T>) -> bool {
        let target = std::ptr::from_ref(value).cast::<()>();
        with_value!(self, v => Arc::as_ptr(v).cast::<()>() == target)
    }

    pub(crate) fn apply_json(&self, value: &Value) -> Applied {
        with_value!(self, v => v.apply_json(value))
    }

    pub(crate) fn bind(
        &self,
        dispatcher: &Arc<Dispatcher>,
        undo: Option<&Weak<dyn UndoManager>>,
    ) -> bool {
        with_value!(self, v => v.bind(dispatcher, undo))
    }
}
