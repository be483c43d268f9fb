//! Stencil worker binary
//!
//! Serves control frames with the demo registry: `echo_args`, `echo_scope`,
//! `relay` and the `demo` module.

#![allow(unused_crate_dependencies)]

use std::process::ExitCode;

fn main() -> ExitCode {
    worker::bootstrap::main_with(&worker::demo::registry())
}
