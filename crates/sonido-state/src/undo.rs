//! Undo manager collaborator.
//!
//! The state layer never owns an undo history. It borrows an external
//! [`UndoManager`] (held as a `Weak` reference) and hands it one
//! [`UndoAction`] per control-thread mutation, wrapped in a transaction.

/// External undo history.
///
/// Implementations decide how transactions are grouped and how many are kept.
/// Methods are only called from the control thread.
pub trait UndoManager: Send + Sync {
    /// Open a transaction named `name`.
    fn begin_transaction(&self, name: &str);

    /// Record one reversible action into the open transaction.
    fn record(&self, action: UndoAction);

    /// Close the open transaction.
    fn commit_transaction(&self);
}

type Replay = Box<dyn Fn() + Send + Sync>;

/// One reversible mutation.
///
/// `undo` restores the value that was replaced and `redo` re-applies the new
/// one. Replaying fires the usual change notifications but never records a
/// new transaction.
pub struct UndoAction {
    description: String,
    undo: Replay,
    redo: Replay,
}

impl UndoAction {
    /// Build an action from its two replay closures.
    pub fn new<U, R>(description: impl Into<String>, undo: U, redo: R) -> Self
    where
        U: Fn() + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            undo: Box::new(undo),
            redo: Box::new(redo),
        }
    }

    /// Short human-readable label, e.g. `Set gain`.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Restore the previous value.
    pub fn undo(&self) {
        (self.undo)();
    }

    /// Re-apply the recorded value.
    pub fn redo(&self) {
        (self.redo)();
    }
}

impl std::fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Record `action` as a single-action transaction named after it.
pub(crate) fn record_transaction(manager: &dyn UndoManager, action: UndoAction) {
    manager.begin_transaction(action.description());
    manager.record(action);
    manager.commit_transaction();
}
