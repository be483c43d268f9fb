//! Worker side of the Stencil protocol
//!
//! A worker attaches to an inherited control socket, applies the frames it
//! receives, forks on request and finally hands the socket to a registered
//! entry point. Build a worker binary by filling a [`Registry`] and passing it
//! to [`bootstrap::main_with`].

#![allow(unused_crate_dependencies)]

pub mod bootstrap;
pub mod demo;
pub mod error;
pub mod registry;
pub mod serve;


pub use error::{Result, ServeError};
pub use registry::{Arg, Handoff, Registry, Scope};
pub use serve::{Exit, ServeLoop};
