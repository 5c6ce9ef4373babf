//! RAII listener registration handle.

use std::sync::Weak;

/// Identifier of one listener inside a broadcaster registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Something a registration can be released from.
///
/// Implemented by broadcaster registries. The handle only holds a `Weak`
/// reference, so a registry that is already gone makes release a no-op.
pub(crate) trait Deregister: Send + Sync {
    fn deregister(&self, id: ListenerId);
}

struct Registration {
    registry: Weak<dyn Deregister>,
    id: ListenerId,
}

/// Owner of a single listener registration.
///
/// Dropping the handle removes the listener; no notification reaches the
/// callback after the next drain or processing block. The handle is move-only
/// so exactly one owner controls the listener's lifetime.
///
/// A default-constructed handle is empty and dropping it does nothing, which
/// makes it convenient as a struct field that is connected later.
///
/// Handles must be dropped on the control thread: release publishes a new
/// listener snapshot, which allocates.
#[derive(Default)]
#[must_use = "dropping a ScopedCallback immediately disconnects the listener"]
pub struct ScopedCallback {
    registration: Option<Registration>,
}

impl ScopedCallback {
    pub(crate) fn new(registry: Weak<dyn Deregister>, id: ListenerId) -> Self {
        Self {
            registration: Some(Registration { registry, id }),
        }
    }

    /// Whether this handle still owns a live registration.
    pub fn is_connected(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.registry.strong_count() > 0)
    }

    /// The listener this handle owns, if any.
    pub fn id(&self) -> Option<ListenerId> {
        self.registration.as_ref().map(|r| r.id)
    }

    /// Release the registration now. Idempotent.
    pub fn reset(&mut self) {
        if let Some(registration) = self.registration.take()
            && let Some(registry) = registration.registry.upgrade()
        {
            registry.deregister(registration.id);
        }
    }
}

impl Drop for ScopedCallback {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for ScopedCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedCallback")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
