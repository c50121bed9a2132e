//! Error types for the engine
//!
//! Every failure the engine can hit falls into one of four classes, and the class
//! decides what the connection supervisor does next:
//!
//! - [`EngineError::Connection`] - transport broke or the daemon is unreachable;
//!   the session is torn down and a reconnect is scheduled.
//! - [`EngineError::Protocol`] - the daemon answered a command with an error; the
//!   session survives if the error can be cleared.
//! - [`EngineError::Validation`] - the caller sent something unusable; rejected
//!   before anything reaches the daemon.
//! - [`EngineError::Resource`] - a state, last-played or smart playlist file could
//!   not be read or written.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Transport failure or daemon unreachable
    #[error("MPD disconnected: {0}")]
    Connection(String),

    /// Daemon rejected or failed a command
    #[error("MPD error for {command}: {message}")]
    Protocol { command: String, message: String },

    /// Malformed payload or unsafe name
    #[error("Invalid request: {0}")]
    Validation(String),

    /// File I/O on engine-owned state
    #[error("Can not access {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding of persisted data
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn protocol(command: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Protocol {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Resource {
            path: path.into(),
            source,
        }
    }

    /// True if the session can not continue after this error
    pub fn is_connection(&self) -> bool {
        matches!(self, EngineError::Connection(_))
    }
}

/// Convenience Result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;
