//! Host integration collaborator.

use crate::holder::ParamHolder;

/// The host-facing processor that exposes parameters to the plugin host.
///
/// [`PluginState::initialise`](crate::PluginState::initialise) hands it the
/// finished tree exactly once so it can register every [`Parameter`](crate::Parameter)
/// with the host's automation system.
pub trait HostProcessor {
    /// Register the parameters of `holder` with the host.
    fn bind_parameters(&mut self, holder: &ParamHolder);
}
