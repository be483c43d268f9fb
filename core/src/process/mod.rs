//! Direct child process management
//!
//! Starting a fresh worker is the only place this crate creates an OS process
//! itself; everything else is forked remotely by a template worker. The
//! process handles returned here are what lets a [`crate::ProcessHandle`]
//! signal and reap its direct child.
//!
//! ## Platform Support
//!
//! - **Unix**: spawning with inherited descriptors, optional new session
//!   and process-group signalling

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
