//! IPC error types and utilities

use thiserror::Error;

/// IPC-specific error types
#[derive(Error, Debug)]
pub enum IpcError {
    /// The peer closed the channel
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Reading from the channel failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Unknown tag or malformed payload
    #[error("Protocol corruption: {0}")]
    ProtocolCorruption(String),

    /// A frame declared a payload above the limit
    #[error("Frame payload of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload length
        len: usize,
        /// Largest accepted payload length
        max: usize,
    },

    /// A descriptor marker arrived without exactly one descriptor
    #[error("Descriptor transfer failed: {0}")]
    DescriptorTransfer(String),
}

impl IpcError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            IpcError::ConnectionClosed => "IPC001",
            IpcError::ReceiveFailed(_) => "IPC002",
            IpcError::ProtocolCorruption(_) => "IPC003",
            IpcError::FrameTooLarge { .. } => "IPC004",
            IpcError::DescriptorTransfer(_) => "IPC005",
        }
    }

    /// Whether the error means the peer went away rather than misbehaved
    pub fn is_closed(&self) -> bool {
        matches!(self, IpcError::ConnectionClosed | IpcError::ReceiveFailed(_))
    }
}

/// IPC-specific result type
pub type Result<T> = std::result::Result<T, IpcError>;
