//! Relay error types.

use thiserror::Error;

use crate::shutdown::LifecycleState;

/// Errors raised by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be bound. Fatal at startup.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Generic I/O failure on the listener.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid lifecycle state: {0:?}")]
    InvalidState(LifecycleState),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The metrics recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Errors that can occur when loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}
