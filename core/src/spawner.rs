//! Process spawner seam
//!
//! The factory never starts processes itself; it describes what it wants in a
//! [`SpawnRequest`] and hands it to a [`ProcessSpawner`]. This keeps the
//! factory testable with [`MockSpawner`] and lets embedders substitute their
//! own launcher (a sandbox wrapper, a different exec strategy).

// Allow unsafe code for this module since the mock duplicates borrowed descriptors
#![allow(unsafe_code)]

use crate::process::{self, ChildProcess};
use crate::{CoreError, Result};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Everything needed to start one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, not including the program name
    pub args: Vec<String>,
    /// Complete environment of the new process
    pub env: Vec<(String, String)>,
    /// Descriptors that must stay open across `exec`
    pub inherit_fds: Vec<RawFd>,
    /// Start the process in a new session and process group
    pub new_session: bool,
}

/// Result of a successful spawn
#[derive(Debug)]
pub struct SpawnedChild {
    /// OS process ID of the new process
    pub pid: u32,
    /// Handle for waiting and signalling, when the spawner can provide one
    pub process: Option<ChildProcess>,
}

/// Trait for starting worker processes
pub trait ProcessSpawner: Send + Sync + std::fmt::Debug {
    /// Start a process described by `request`.
    ///
    /// Descriptors in `request.inherit_fds` are borrowed; they are valid for
    /// the duration of the call only.
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild>;
}

/// Spawner backed by `tokio::process::Command`
#[derive(Copy, Clone, Debug, Default)]
pub struct CommandSpawner;

impl CommandSpawner {
    /// Create a new command spawner
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild> {
        let child = process::spawn(request)?;
        Ok(SpawnedChild {
            pid: child.pid(),
            process: Some(child),
        })
    }
}

/// Mock spawner for testing
///
/// Records every request and keeps a duplicate of each inherited descriptor,
/// so a test can play the worker's side of the control channel.
#[derive(Debug, Clone, Default)]
pub struct MockSpawner {
    state: Arc<Mutex<MockState>>,
    fail: bool,
}

#[derive(Debug, Default)]
struct MockState {
    requests: Vec<SpawnRequest>,
    channels: Vec<OwnedFd>,
    next_pid: u32,
}

const MOCK_PID_BASE: u32 = 40_000;

impl MockSpawner {
    /// Create a mock that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that always fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.lock().requests.clone()
    }

    /// Take the duplicated descriptors of every inherited fd seen so far
    pub fn take_channels(&self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.lock().channels)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild> {
        debug!("Spawning mock worker for: {} {:?}", request.program.display(), request.args);

        let mut state = self.lock();
        state.requests.push(request.clone());
        if self.fail {
            return Err(CoreError::SpawnFailure(format!(
                "mock spawner refused '{}'",
                request.program.display()
            )));
        }

        for &fd in &request.inherit_fds {
            // SAFETY: the caller keeps every inherited descriptor open for the
            // duration of this call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            state.channels.push(borrowed.try_clone_to_owned()?);
        }

        let pid = MOCK_PID_BASE + state.next_pid;
        state.next_pid += 1;
        Ok(SpawnedChild { pid, process: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn request(inherit_fds: Vec<RawFd>) -> SpawnRequest {
        SpawnRequest {
            program: PathBuf::from("/usr/bin/stencil-worker"),
            args: vec!["3".to_string(), "1".to_string()],
            env: vec![],
            inherit_fds,
            new_session: false,
        }
    }

    #[test]
    fn test_mock_records_requests_and_assigns_pids() {
        let spawner = MockSpawner::new();
        let a = spawner.spawn(&request(vec![])).unwrap();
        let b = spawner.spawn(&request(vec![])).unwrap();

        assert_eq!(a.pid, MOCK_PID_BASE);
        assert_eq!(b.pid, MOCK_PID_BASE + 1);
        assert!(a.process.is_none());
        assert_eq!(spawner.requests().len(), 2);
    }

    #[test]
    fn test_mock_keeps_inherited_channel_alive() {
        let spawner = MockSpawner::new();
        let (mut local, remote) = UnixStream::pair().unwrap();
        spawner.spawn(&request(vec![remote.as_raw_fd()])).unwrap();
        drop(remote);

        let channels = spawner.take_channels();
        assert_eq!(channels.len(), 1);
        let mut peer = UnixStream::from(channels.into_iter().next().unwrap());

        local.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert!(spawner.take_channels().is_empty());
    }

    #[test]
    fn test_failing_mock() {
        let spawner = MockSpawner::failing();
        let err = spawner.spawn(&request(vec![])).unwrap_err();
        assert!(matches!(err, CoreError::SpawnFailure(_)));
        assert_eq!(spawner.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_command_spawner_runs_program() {
        let spawner = CommandSpawner::new();
        let mut req = request(vec![]);
        req.program = PathBuf::from("/bin/sh");
        req.args = vec!["-c".to_string(), "exit 3".to_string()];

        let spawned = spawner.spawn(&req).unwrap();
        let mut child = spawned.process.expect("command spawner returns the child");
        assert_eq!(child.pid(), spawned.pid);
        assert_eq!(child.wait().await.unwrap().code(), Some(3));
    }
}
