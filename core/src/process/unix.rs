//! Unix process spawning with inherited control descriptors
//!
//! Fresh workers are started from an explicit program path, a cleared
//! environment, and a list of descriptors that must survive `exec`. Every
//! descriptor we create is close-on-exec; the ones named in
//! [`SpawnRequest::inherit_fds`] have that flag cleared in the child only,
//! between `fork` and `exec`, so concurrent spawns never leak each other's
//! channels.
//!
//! ## Process Groups
//!
//! With [`SpawnRequest::new_session`] the child calls `setsid()` and becomes
//! leader of its own process group. Signals are then delivered to the whole
//! group, which also reaches any grandchildren forked off a template.

// Allow unsafe code for this module since process management requires libc calls in pre_exec
#![allow(unsafe_code)]

use crate::spawner::SpawnRequest;
use crate::{CoreError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// A directly spawned worker process
#[derive(Debug)]
pub struct ChildProcess {
    /// The process ID of the spawned process
    pid: Pid,
    /// Whether the child leads its own process group
    group_leader: bool,
    /// The underlying Child handle for waiting and status checking
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Whether signals go to the child's whole process group
    pub fn is_group_leader(&self) -> bool {
        self.group_leader
    }

    /// Wait for the process to exit and return its exit status (async)
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(|e| {
            CoreError::Initialization(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Try to wait for the process to exit without blocking
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        self.child.try_wait().map_err(|e| {
            CoreError::Initialization(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))
        })
    }
}

/// Spawn a worker as described by `request`.
///
/// Standard input is closed; standard output and error are inherited so the
/// worker's diagnostics reach the same place as ours.
///
/// ## Safety
///
/// The `pre_exec` hook only calls `setsid()` and `fcntl()`, both of which are
/// async-signal-safe, and touches no memory allocated after the fork.
pub fn spawn(request: &SpawnRequest) -> Result<ChildProcess> {
    debug!(
        "Spawning worker: {} {:?} (inherit {:?})",
        request.program.display(),
        request.args,
        request.inherit_fds
    );

    let mut command = Command::new(&request.program);
    command.args(&request.args);
    command.env_clear();
    command.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command.stdin(Stdio::null());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    let inherit = request.inherit_fds.clone();
    let new_session = request.new_session;

    // Safety: setsid() and fcntl() are async-signal-safe and appropriate for use in pre_exec
    #[deny(unsafe_op_in_unsafe_fn)]
    unsafe {
        command.pre_exec(move || {
            if new_session && libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            for &fd in &inherit {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn worker '{}': {}", request.program.display(), e);
        CoreError::SpawnFailure(format!(
            "Failed to spawn '{}': {}",
            request.program.display(),
            e
        ))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::SpawnFailure("Spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Successfully spawned worker {}", pid);

    Ok(ChildProcess {
        pid,
        group_leader: new_session,
        child,
    })
}

/// Send SIGTERM for graceful termination
///
/// A group leader is signalled through its process group.
///
/// ## Error Handling
///
/// - `ESRCH` (No such process) is treated as success since it means the
///   process has already exited
/// - Other errors are propagated as `ProcessSignal` errors
pub fn signal_term(child: &ChildProcess) -> Result<()> {
    deliver(child, Signal::SIGTERM)
}

/// Send SIGKILL for forceful termination
pub fn signal_kill(child: &ChildProcess) -> Result<()> {
    deliver(child, Signal::SIGKILL)
}

fn deliver(child: &ChildProcess, signal: Signal) -> Result<()> {
    debug!("Sending {} to worker {}", signal, child.pid);

    let outcome = if child.is_group_leader() {
        killpg(child.pid, signal)
    } else {
        kill(child.pid, signal)
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            debug!("Worker {} already exited", child.pid);
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {} to worker {}: {}", signal, child.pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to worker {}: {}",
                signal, child.pid, e
            )))
        }
    }
}
