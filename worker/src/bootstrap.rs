//! Worker bootstrap: argv parsing, attach, process title and logging
//!
//! A fresh worker is started as `stencil-worker <control-fd> <owner-pid>`.
//! The control descriptor is inherited from the parent; the owner pid is only
//! used for diagnostics and the process title.

// Allow unsafe code for this module since adopting an inherited fd and prctl() require it
#![allow(unsafe_code)]

use crate::registry::Registry;
use crate::serve::{Exit, ServeLoop};
use crate::{Result, ServeError};
use clap::Parser;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use tracing::{debug, error, info};

/// Environment variable overriding the worker's log level
pub const LOG_ENV: &str = "STENCIL_LOG";

/// Command-line arguments of a worker process
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "stencil-worker")]
#[command(about = "Serve stencil control frames on an inherited socket")]
#[command(version)]
pub struct WorkerArgs {
    /// Inherited control socket descriptor
    pub fd: RawFd,

    /// Pid of the process that created this worker
    pub owner: u32,
}

/// Take ownership of the inherited control socket.
///
/// The descriptor is made close-on-exec and blocking.
pub fn attach(fd: RawFd) -> Result<UnixStream> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(|e| {
        ServeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("control descriptor {fd} is not open: {e}"),
        ))
    })?;
    // SAFETY: the descriptor is open and was passed to this process for its
    // exclusive use; nothing else in the process refers to it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    fcntl(owned.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;

    let control = UnixStream::from(owned);
    control.set_nonblocking(false)?;
    Ok(control)
}

/// Process title for a worker serving `owner`
pub fn process_title(owner: u32, forked: bool) -> String {
    if forked {
        format!("stencil/{owner}/f")
    } else {
        format!("stencil/{owner}")
    }
}

/// Set the thread name shown by `ps` and `top`
///
/// The kernel truncates it to 15 bytes.
#[cfg(target_os = "linux")]
pub fn set_process_title(owner: u32, forked: bool) {
    let Ok(name) = std::ffi::CString::new(process_title(owner, forked)) else {
        return;
    };
    // SAFETY: PR_SET_NAME reads at most 16 bytes from a valid NUL-terminated string
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        debug!("prctl(PR_SET_NAME) failed: {}", io::Error::last_os_error());
    }
}

/// Set the process title (no-op on this platform)
#[cfg(not(target_os = "linux"))]
pub fn set_process_title(_owner: u32, _forked: bool) {}

fn forked_title(owner: u32) {
    set_process_title(owner, true);
}

/// Install a stderr subscriber; `RUST_LOG` wins over `STENCIL_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });

    // A subscriber may already be installed by an embedding binary
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Attach to the control socket named in `args` and serve it
pub fn serve(args: &WorkerArgs, registry: &Registry) -> Result<Exit> {
    let control = attach(args.fd)?;
    set_process_title(args.owner, false);
    info!(
        "Worker {} attached to fd {} for owner {}",
        std::process::id(),
        args.fd,
        args.owner
    );

    ServeLoop::new(registry, control, args.owner)
        .reap_children(true)
        .on_fork_child(forked_title)
        .run()
}

/// Entry point for worker binaries: parse argv, serve, report
pub fn main_with(registry: &Registry) -> ExitCode {
    let args = WorkerArgs::parse();
    init_tracing();

    match serve(&args, registry) {
        Ok(exit) => {
            debug!("Worker {} finished: {:?}", std::process::id(), exit);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[{}] {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}
