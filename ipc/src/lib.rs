#![allow(unused_crate_dependencies)]
//! IPC (Inter-Process Communication) module
//!
//! This crate defines the control-channel protocol spoken between a process
//! handle and the worker it prepares: the command frames, the sub-string
//! encoding inside them, and the transfer of open descriptors alongside.

#[cfg(unix)]
pub mod fdpass;
pub mod error;
pub mod frame;
pub mod varint;

#[cfg(test)]
mod error_tests;

pub use error::{IpcError, Result};
pub use frame::{Frame, FrameReader, Tag, HEADER_LEN, MAX_PAYLOAD_LEN};
