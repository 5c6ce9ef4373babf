//! Error types for plugin state operations.
//!
//! Only wiring mistakes and configuration I/O surface as errors. Malformed
//! saved state is not an error: [`PluginState::deserialize`](crate::PluginState::deserialize)
//! skips what it cannot read and reports it in a [`LoadReport`](crate::LoadReport).

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while wiring or using a [`PluginState`](crate::PluginState).
#[derive(Debug, Error)]
pub enum StateError {
    /// An API was used before `initialise`.
    #[error("plugin state used before initialise")]
    NotInitialised,

    /// `initialise` was called a second time.
    #[error("plugin state is already initialised")]
    AlreadyInitialised,

    /// Listener registration named a parameter that is not in the tree.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// Listener registration named a state value that is not in the tree.
    #[error("unknown state value: {0}")]
    UnknownStateValue(String),

    /// Two leaves in the tree share an identity.
    #[error("duplicate state identity '{0}'")]
    DuplicateIdentity(String),

    /// Failed to encode a state snapshot.
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    /// Failed to read a configuration file.
    #[error("failed to read config '{path}': {source}")]
    ReadConfig {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration TOML.
    #[error("failed to parse config TOML: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to serialize configuration TOML.
    #[error("failed to serialize config TOML: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration values are out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl StateError {
    /// Create a read config error.
    pub fn read_config(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::ReadConfig {
            path: path.into(),
            source,
        }
    }
}
