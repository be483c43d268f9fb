//! The worker's command loop
//!
//! A [`ServeLoop`] reads frames from its control socket one at a time and
//! applies them:
//!
//! - `handle` receives one descriptor and appends it to the accumulator
//! - `args` appends strings to the accumulator
//! - `eval` calls a registered command; failures are logged, not fatal
//! - `fork` forks the process. The child continues the loop on the
//!   descriptor that preceded the frame, the parent on its own socket.
//! - `run` hands the socket, accumulator and scope to an entry point. The
//!   loop never resumes.
//!
//! The reader never consumes more than one frame, so the marker byte carrying
//! a descriptor is always read by `recv_fd` rather than buffered away.

// Allow unsafe code for this module since fork() and signal disposition changes require it
#![allow(unsafe_code)]

use crate::registry::{Arg, Handoff, Registry, Scope};
use crate::{Result, ServeError};
use ipc::{Frame, FrameReader, IpcError};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{fork, getpid, ForkResult};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, error, info, warn};

/// How a serve loop ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The control socket closed or failed before `run`
    Closed,
    /// An entry point ran and returned successfully
    HandedOff,
}

/// Frame-driven state machine of one worker process
pub struct ServeLoop<'r> {
    registry: &'r Registry,
    control: UnixStream,
    reader: FrameReader,
    accumulator: Vec<Arg>,
    scope: Scope,
    owner: u32,
    reap_children: bool,
    on_fork_child: Option<fn(u32)>,
}

impl std::fmt::Debug for ServeLoop<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeLoop")
            .field("control", &self.control)
            .field("accumulator", &self.accumulator)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<'r> ServeLoop<'r> {
    /// Serve `control` on behalf of `owner`
    ///
    /// The socket must be in blocking mode.
    pub fn new(registry: &'r Registry, control: UnixStream, owner: u32) -> Self {
        Self {
            registry,
            control,
            reader: FrameReader::new(),
            accumulator: Vec::new(),
            scope: Scope::default(),
            owner,
            reap_children: false,
            on_fork_child: None,
        }
    }

    /// Let the kernel reap forked children while serving.
    ///
    /// `SIGCHLD` is ignored until the hand-off, where the default disposition
    /// is restored for user code.
    #[must_use]
    pub fn reap_children(mut self, enabled: bool) -> Self {
        self.reap_children = enabled;
        self
    }

    /// Hook called with the owner pid in every forked child
    #[must_use]
    pub fn on_fork_child(mut self, hook: fn(u32)) -> Self {
        self.on_fork_child = Some(hook);
        self
    }

    /// Process frames until the socket closes or an entry point returns.
    ///
    /// # Errors
    ///
    /// - [`ServeError::Protocol`] for an unknown tag, a malformed frame, or a
    ///   `fork` without a preceding descriptor
    /// - [`ServeError::UnknownEntryPoint`] if `run` names nothing registered
    /// - [`ServeError::EntryFailed`] if the entry point returns an error
    pub fn run(mut self) -> Result<Exit> {
        if self.reap_children {
            set_sigchld(SigHandler::SigIgn)?;
        }
        loop {
            let frame = match self.reader.read_frame(&mut self.control) {
                Ok(frame) => frame,
                Err(e) if e.is_closed() => {
                    debug!("Control channel closed: {}", e);
                    return Ok(Exit::Closed);
                }
                Err(e) => {
                    error!("Corrupt frame on control channel: {}", e);
                    return Err(e.into());
                }
            };

            match frame {
                Frame::Handle => match ipc::fdpass::recv_fd(self.control.as_fd()) {
                    Ok(fd) => self.accumulator.push(Arg::Fd(fd)),
                    Err(e) if e.is_closed() => {
                        debug!("Control channel closed awaiting descriptor: {}", e);
                        return Ok(Exit::Closed);
                    }
                    Err(e) => {
                        error!("Descriptor transfer failed: {}", e);
                        return Err(e.into());
                    }
                },
                Frame::Args(strings) => {
                    self.accumulator
                        .extend(strings.into_iter().map(Arg::Bytes));
                }
                Frame::Eval { command, args } => {
                    if let Err(e) =
                        self.registry
                            .eval(&mut self.scope, &command, &self.accumulator, &args)
                    {
                        warn!("eval '{}' failed: {:#}", command, e);
                    }
                }
                Frame::Fork => self.fork()?,
                Frame::Run { entry } => return self.hand_off(&entry),
            }
        }
    }

    fn fork(&mut self) -> Result<()> {
        let channel = match self.accumulator.pop() {
            Some(Arg::Fd(fd)) => fd,
            _ => {
                return Err(IpcError::ProtocolCorruption(
                    "fork frame without a preceding descriptor".to_string(),
                )
                .into())
            }
        };

        // SAFETY: the serve loop runs on the only thread of this process; the
        // child continues with the same loop and no other thread's state.
        let outcome = unsafe { fork() };
        self.after_fork(outcome, channel)
    }

    /// Continue the loop on whichever side of the fork we ended up.
    ///
    /// Only the child keeps `channel`. Outside the child the accumulator is
    /// cleared whatever the outcome, so a later `run` never sees arguments
    /// meant for the child.
    fn after_fork(&mut self, outcome: nix::Result<ForkResult>, channel: OwnedFd) -> Result<()> {
        match outcome {
            Ok(ForkResult::Child) => {
                let control = UnixStream::from(channel);
                control.set_nonblocking(false)?;
                self.control = control;
                self.reader = FrameReader::new();
                self.accumulator.clear();
                if let Some(hook) = self.on_fork_child {
                    hook(self.owner);
                }
                debug!("Forked worker {} serving new channel", getpid());
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("Forked child worker {}", child);
                self.accumulator.clear();
            }
            Err(errno) => {
                error!("fork failed: {}", errno);
                self.accumulator.clear();
            }
        }
        Ok(())
    }

    fn hand_off(self, entry: &str) -> Result<Exit> {
        let Some(entry_point) = self.registry.entry_point(entry) else {
            error!("Unknown entry point '{}'", entry);
            return Err(ServeError::UnknownEntryPoint(entry.to_string()));
        };
        if self.reap_children {
            set_sigchld(SigHandler::SigDfl)?;
        }

        info!(
            "Handing off to '{}' with {} arguments",
            entry,
            self.accumulator.len()
        );
        let handoff = Handoff {
            control: self.control,
            args: self.accumulator,
            scope: self.scope,
            owner: self.owner,
        };
        entry_point(handoff).map_err(|e| ServeError::EntryFailed {
            entry: entry.to_string(),
            reason: format!("{e:#}"),
        })?;
        Ok(Exit::HandedOff)
    }
}

fn set_sigchld(handler: SigHandler) -> Result<()> {
    // SAFETY: SigIgn and SigDfl install no Rust handler code.
    unsafe { signal(Signal::SIGCHLD, handler) }
        .map(|_| ())
        .map_err(|e| ServeError::Io(e.into()))
}
