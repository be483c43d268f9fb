//! Parent-side process handles
//!
//! A [`ProcessHandle`] stands for one worker that is being prepared. Queue
//! operations encode command frames into the handle's [`WriteQueue`] and
//! return immediately; a watcher task on the current Tokio runtime drains the
//! queue whenever the control socket is writable.
//!
//! ## Lifecycle
//!
//! - **Open**: commands may be queued.
//! - **Terminal**: `run` or `to_raw_socket` was called. Nothing more may be
//!   queued; the ready callback fires once the queue drains.
//! - **Inert**: the callback has fired (or the handle was destroyed).
//! - **Failed**: the channel broke. Pending items were dropped, pending
//!   descriptors closed, and the callback will never fire.
//!
//! The watcher is armed exactly while the queue is non-empty. It holds its own
//! reference to the handle state, so dropping a `ProcessHandle` lets queued
//! commands finish; [`ProcessHandle::destroy`] cancels them.

use crate::process::{self, ChildProcess};
use crate::queue::{Flush, WriteQueue};
use crate::{CoreError, Result};
use ipc::Frame;
use std::fmt;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace};

/// Callback receiving the control socket once a terminal command is delivered
pub type ReadyCallback = Box<dyn FnOnce(UnixStream) + Send + 'static>;

/// Observable transmission state of a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleStatus {
    /// Nothing queued
    Idle,
    /// The watcher is draining the queue
    Busy,
    /// The terminal callback has run
    Finished,
    /// The channel failed; carries the reason
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Open,
    Terminal,
    Inert,
    Failed(String),
}

struct Inner {
    socket: Option<UnixStream>,
    queue: WriteQueue,
    phase: Phase,
    on_ready: Option<ReadyCallback>,
    watcher: Option<AbortHandle>,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        match &self.phase {
            Phase::Open => Ok(()),
            Phase::Terminal | Phase::Inert => Err(CoreError::HandleInert),
            Phase::Failed(reason) => Err(CoreError::HandleFailed(reason.clone())),
        }
    }
}

/// What the watcher should do after a transmit attempt
enum Step {
    Blocked,
    Idle,
    Failed,
    Finished(UnixStream, ReadyCallback),
}

struct Shared {
    inner: Mutex<Inner>,
    status: watch::Sender<HandleStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a watcher unless one is running or there is nothing to send
    fn arm(self: &Arc<Self>, inner: &mut Inner, runtime: &RuntimeHandle) -> Result<()> {
        if inner.watcher.is_some() || inner.queue.is_empty() {
            return Ok(());
        }
        let Some(socket) = inner.socket.as_ref() else {
            return Err(CoreError::HandleInert);
        };

        // Register a duplicate so the original stays free for the callback
        let registered = socket
            .try_clone()
            .and_then(|dup| AsyncFd::with_interest(dup, Interest::WRITABLE));
        let registered = match registered {
            Ok(fd) => fd,
            Err(e) => {
                let reason = format!("cannot watch control socket: {e}");
                self.fail(inner, reason.clone());
                return Err(CoreError::HandleFailed(reason));
            }
        };

        let task = runtime.spawn(watch_writable(Arc::clone(self), registered));
        inner.watcher = Some(task.abort_handle());
        self.status.send_replace(HandleStatus::Busy);
        trace!("write watcher armed with {} items", inner.queue.len());
        Ok(())
    }

    fn transmit(&self) -> Step {
        let mut inner = self.lock();
        let Inner { socket, queue, .. } = &mut *inner;
        let Some(socket) = socket.as_mut() else {
            inner.watcher = None;
            return Step::Idle;
        };

        match queue.flush(socket) {
            Ok(Flush::Blocked) => Step::Blocked,
            Ok(Flush::Drained) => {
                inner.watcher = None;
                self.drained(&mut inner)
            }
            Err(e) => {
                self.fail(&mut inner, e.to_string());
                Step::Failed
            }
        }
    }

    /// Queue just became empty with the watcher disarmed
    fn drained(&self, inner: &mut Inner) -> Step {
        if inner.phase != Phase::Terminal {
            self.status.send_replace(HandleStatus::Idle);
            return Step::Idle;
        }
        inner.phase = Phase::Inert;
        match (inner.socket.take(), inner.on_ready.take()) {
            (Some(socket), Some(callback)) => Step::Finished(socket, callback),
            _ => {
                self.status.send_replace(HandleStatus::Finished);
                Step::Idle
            }
        }
    }

    fn fail(&self, inner: &mut Inner, reason: String) {
        error!("Process handle channel failed: {}", reason);
        inner.queue.clear();
        inner.socket = None;
        inner.on_ready = None;
        inner.watcher = None;
        inner.phase = Phase::Failed(reason.clone());
        self.status.send_replace(HandleStatus::Failed(reason));
    }

    fn finish(&self, socket: UnixStream, callback: ReadyCallback) {
        debug!("Queue drained after terminal command, handing over socket");
        callback(socket);
        self.status.send_replace(HandleStatus::Finished);
    }
}

async fn watch_writable(shared: Arc<Shared>, registered: AsyncFd<UnixStream>) {
    loop {
        let mut ready = match registered.writable().await {
            Ok(ready) => ready,
            Err(e) => {
                let mut inner = shared.lock();
                shared.fail(&mut inner, format!("writability watch failed: {e}"));
                return;
            }
        };
        match shared.transmit() {
            Step::Blocked => ready.clear_ready(),
            Step::Idle | Step::Failed => return,
            Step::Finished(socket, callback) => {
                drop(ready);
                shared.finish(socket, callback);
                return;
            }
        }
    }
}

/// Handle to a worker process being prepared over a control socket
pub struct ProcessHandle {
    shared: Arc<Shared>,
    pid: Option<u32>,
    child: Option<ChildProcess>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

impl ProcessHandle {
    /// Wrap an already connected control socket.
    ///
    /// The socket is switched to non-blocking mode. The handle has no pid.
    pub fn from_socket(socket: UnixStream) -> Result<Self> {
        Self::with_child(socket, None, None)
    }

    pub(crate) fn with_child(
        socket: UnixStream,
        pid: Option<u32>,
        child: Option<ChildProcess>,
    ) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let (status, _) = watch::channel(HandleStatus::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    socket: Some(socket),
                    queue: WriteQueue::new(),
                    phase: Phase::Open,
                    on_ready: None,
                    watcher: None,
                }),
                status,
            }),
            pid,
            child,
        })
    }

    /// Pid of the worker if it is our direct child
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current transmission state
    pub fn status(&self) -> HandleStatus {
        self.shared.status.borrow().clone()
    }

    /// Whether no further commands may be queued
    pub fn is_inert(&self) -> bool {
        self.shared.lock().phase != Phase::Open
    }

    /// Number of items still waiting to be sent
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    fn enqueue(&self, stage: impl FnOnce(&mut WriteQueue) -> Result<()>) -> Result<()> {
        let runtime = RuntimeHandle::try_current().map_err(|_| CoreError::ReactorUnavailable)?;
        let mut staged = WriteQueue::new();
        stage(&mut staged)?;

        let mut inner = self.shared.lock();
        inner.ensure_open()?;
        inner.queue.append(&mut staged);
        self.shared.arm(&mut inner, &runtime)
    }

    fn enqueue_frame(&self, frame: Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.enqueue(|queue| {
            queue.push_bytes(bytes);
            Ok(())
        })
    }

    /// Call the named eval command in the worker with `args`
    pub fn eval<I, S>(&self, command: &str, args: I) -> Result<&Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.enqueue_frame(Frame::eval(command, args))?;
        Ok(self)
    }

    /// Load the named modules in the worker
    pub fn require<I, S>(&self, modules: I) -> Result<&Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.eval("require", modules)
    }

    /// Queue descriptors for transfer.
    ///
    /// The handle owns each descriptor until it has been sent, and closes any
    /// that are still pending if the handle fails or is destroyed.
    pub fn send_fh<I>(&self, fds: I) -> Result<&Self>
    where
        I: IntoIterator<Item = OwnedFd>,
    {
        let header = Frame::Handle.encode()?;
        self.enqueue(|queue| {
            for fd in fds {
                queue.push_bytes(header.clone());
                queue.push_descriptor(fd);
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Append strings to the worker's argument list
    pub fn send_arg<I, S>(&self, strings: I) -> Result<&Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.enqueue_frame(Frame::args(strings))?;
        Ok(self)
    }

    /// Ask the worker to fork a child connected through a new socket.
    ///
    /// The returned handle can be used right away; its commands are sent
    /// once its channel becomes writable, which the kernel allows as soon as
    /// the socket buffer has room. The child only starts reading them after
    /// this handle's queue reaches the fork frame.
    pub fn fork(&self) -> Result<ProcessHandle> {
        let (local, remote) = UnixStream::pair()?;
        let header = Frame::Handle.encode()?;
        let fork = Frame::Fork.encode()?;
        self.enqueue(|queue| {
            queue.push_bytes(header);
            queue.push_descriptor(OwnedFd::from(remote));
            queue.push_bytes(fork);
            Ok(())
        })?;
        debug!("Queued fork on worker {:?}", self.pid);
        ProcessHandle::from_socket(local)
    }

    /// Hand the worker over to the named entry point.
    ///
    /// `on_ready` receives the control socket once everything queued so far,
    /// including the `run` frame, has been sent. The handle is inert from now
    /// on. If the channel fails first, `on_ready` is never called and
    /// [`ProcessHandle::drained`] reports the failure.
    pub fn run<F>(&self, entry: &str, on_ready: F) -> Result<&Self>
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        let frame = Frame::run(entry).encode()?;
        self.seal(Some(frame), Box::new(on_ready))?;
        Ok(self)
    }

    /// Wait for the queue to drain, then yield the raw socket without
    /// sending any further frame.
    ///
    /// The worker is left in its serve loop, so the socket can be handed on
    /// to another handle or process. With an empty queue `on_ready` runs
    /// before this method returns.
    pub fn to_raw_socket<F>(&self, on_ready: F) -> Result<&Self>
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        self.seal(None, Box::new(on_ready))?;
        Ok(self)
    }

    fn seal(&self, frame: Option<Vec<u8>>, on_ready: ReadyCallback) -> Result<()> {
        let runtime = RuntimeHandle::try_current().map_err(|_| CoreError::ReactorUnavailable)?;
        let mut inner = self.shared.lock();
        inner.ensure_open()?;
        if let Some(frame) = frame {
            inner.queue.push_bytes(frame);
        }
        inner.phase = Phase::Terminal;
        inner.on_ready = Some(on_ready);

        if !inner.queue.is_empty() {
            return self.shared.arm(&mut inner, &runtime);
        }
        let step = self.shared.drained(&mut inner);
        drop(inner);
        if let Step::Finished(socket, callback) = step {
            self.shared.finish(socket, callback);
        }
        Ok(())
    }

    /// Resolve once nothing is left to send.
    ///
    /// # Errors
    ///
    /// [`CoreError::HandleFailed`] if the channel failed.
    pub async fn drained(&self) -> Result<()> {
        let mut status = self.shared.status.subscribe();
        let settled = status
            .wait_for(|s| *s != HandleStatus::Busy)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .clone();
        match settled {
            HandleStatus::Failed(reason) => Err(CoreError::HandleFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Send SIGTERM to the worker
    ///
    /// Only handles whose worker we spawned directly can be signalled.
    pub fn terminate(&self) -> Result<()> {
        let child = self.child.as_ref().ok_or(CoreError::NotDirectChild)?;
        process::signal_term(child)
    }

    /// Send SIGKILL to the worker
    pub fn kill(&self) -> Result<()> {
        let child = self.child.as_ref().ok_or(CoreError::NotDirectChild)?;
        process::signal_kill(child)
    }

    /// Wait for a directly spawned worker to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let child = self.child.as_mut().ok_or(CoreError::NotDirectChild)?;
        child.wait().await
    }

    /// Check whether a directly spawned worker has exited, without waiting
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let child = self.child.as_mut().ok_or(CoreError::NotDirectChild)?;
        child.try_wait()
    }

    /// Cancel pending transmission and close the channel.
    ///
    /// Queued descriptors are closed and the ready callback is dropped
    /// without being called. The worker observes end of stream.
    pub fn destroy(self) {
        let mut inner = self.shared.lock();
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        inner.queue.clear();
        inner.socket = None;
        inner.on_ready = None;
        inner.phase = Phase::Inert;
        drop(inner);
        self.shared.status.send_replace(HandleStatus::Idle);
        debug!("Destroyed process handle for {:?}", self.pid);
    }
}
