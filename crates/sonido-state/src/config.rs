//! Runtime configuration for a [`PluginState`](crate::PluginState).
//!
//! # TOML Format
//!
//! ```toml
//! control_queue_capacity = 256
//! processing_queue_capacity = 256
//! app_version = "1.4.0"
//! undo_parameter_changes = true
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StateError;

/// Default capacity of each notification hand-off queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Sizing and behaviour options for plugin state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    /// Capacity of the queue carrying processing → control notifications.
    ///
    /// Each listener occupies at most one slot at a time (deliveries are
    /// coalesced), so this only needs to cover the number of control-thread
    /// listeners that can be pending between two drains.
    pub control_queue_capacity: usize,

    /// Capacity of the queue carrying control → processing notifications.
    pub processing_queue_capacity: usize,

    /// Application version written into every snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    /// Record undo transactions for `PluginState::set_parameter`.
    pub undo_parameter_changes: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            control_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            processing_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            app_version: None,
            undo_parameter_changes: true,
        }
    }
}

impl StateConfig {
    /// Set the application version written into snapshots.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Set both queue capacities.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.control_queue_capacity = capacity;
        self.processing_queue_capacity = capacity;
        self
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| StateError::read_config(path, e))?;
        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "state config loaded");
        Ok(config)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, StateError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, StateError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.control_queue_capacity == 0 {
            return Err(StateError::InvalidConfig(
                "control_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.processing_queue_capacity == 0 {
            return Err(StateError::InvalidConfig(
                "processing_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
