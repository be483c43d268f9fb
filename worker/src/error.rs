//! Worker error types

use thiserror::Error;

/// Fatal serve-loop errors; each one ends the worker process
#[derive(Error, Debug)]
pub enum ServeError {
    /// Unknown tag, malformed frame or broken descriptor transfer
    #[error("Protocol error: {0}")]
    Protocol(#[from] ipc::IpcError),

    /// `run` named an entry point the registry does not have
    #[error("Unknown entry point: {0}")]
    UnknownEntryPoint(String),

    /// The entry point returned an error
    #[error("Entry point '{entry}' failed: {reason}")]
    EntryFailed {
        /// Name of the entry point
        entry: String,
        /// Rendered error chain
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ServeError::Protocol(_) => "SRV001",
            ServeError::UnknownEntryPoint(_) => "SRV002",
            ServeError::EntryFailed { .. } => "SRV003",
            ServeError::Io(_) => "SRV004",
        }
    }
}

/// Worker result type
pub type Result<T> = std::result::Result<T, ServeError>;
