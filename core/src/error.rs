//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    /// Writing to the control socket failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A queued descriptor could not be sent
    #[error("Descriptor transfer failed: {0}")]
    DescriptorTransfer(String),

    /// A worker process could not be started
    #[error("Spawn failure: {0}")]
    SpawnFailure(String),

    /// A terminal command was already queued
    #[error("Handle is inert: no further commands may be queued")]
    HandleInert,

    /// The handle's channel broke earlier
    #[error("Handle failed: {0}")]
    HandleFailed(String),

    /// Queued outside a Tokio runtime
    #[error("No Tokio runtime available to drive the handle")]
    ReactorUnavailable,

    /// Configuration could not be loaded or resolved
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// The worker was forked remotely and cannot be signalled or awaited
    #[error("Handle has no direct child process")]
    NotDirectChild,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Setup such as tracing or waiting on a child failed
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Signal delivery failed
    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ipc::IpcError),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Transport(_) => "CORE001",
            CoreError::DescriptorTransfer(_) => "CORE002",
            CoreError::SpawnFailure(_) => "CORE003",
            CoreError::HandleInert => "CORE004",
            CoreError::HandleFailed(_) => "CORE005",
            CoreError::ReactorUnavailable => "CORE006",
            CoreError::Configuration(_) => "CORE007",
            CoreError::Validation(_) => "CORE008",
            CoreError::NotDirectChild => "CORE009",
            CoreError::Io(_) => "CORE010",
            CoreError::Initialization(_) => "CORE011",
            CoreError::ProcessSignal(_) => "CORE012",
            CoreError::Protocol(_) => "CORE013",
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
