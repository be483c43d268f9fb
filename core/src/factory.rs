//! Process factory: fresh workers and template forks
//!
//! Starting a worker from scratch means exec'ing `stencil-worker` with one end
//! of a socket pair. That is the slow path. The preferred path keeps one such
//! worker alive as a **template** and asks it to fork for every new worker,
//! which costs a `fork()` of a small process instead of an exec.
//!
//! An **early template** is a fresh worker started before the host grows
//! large. When one is installed, even "fresh" workers are forked from it.
//!
//! All cached state lives on the factory. [`ProcessFactory::global`] is a
//! lazily created instance configured from the environment.

use crate::config::{FactoryConfig, WORKER_ENV};
use crate::handle::ProcessHandle;
use crate::spawner::{CommandSpawner, ProcessSpawner, SpawnRequest};
use crate::{CoreError, Result};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info};

/// File name of the worker executable
pub const WORKER_BIN: &str = "stencil-worker";

/// Creates process handles
#[derive(Debug)]
pub struct ProcessFactory {
    config: FactoryConfig,
    spawner: Arc<dyn ProcessSpawner>,
    worker_path: OnceLock<PathBuf>,
    template: Mutex<Option<ProcessHandle>>,
    early: Mutex<Option<ProcessHandle>>,
}

fn lock(slot: &Mutex<Option<ProcessHandle>>) -> MutexGuard<'_, Option<ProcessHandle>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessFactory {
    /// Create a factory that spawns with [`CommandSpawner`]
    pub fn new(config: FactoryConfig) -> Self {
        Self::with_spawner(config, Arc::new(CommandSpawner::new()))
    }

    /// Create a factory with a custom spawner
    pub fn with_spawner(config: FactoryConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            config,
            spawner,
            worker_path: OnceLock::new(),
            template: Mutex::new(None),
            early: Mutex::new(None),
        }
    }

    /// Process-wide factory configured from the environment.
    ///
    /// # Errors
    ///
    /// Returns the configuration error from the first initialisation attempt;
    /// later calls retry.
    pub fn global() -> Result<&'static ProcessFactory> {
        static GLOBAL: OnceLock<ProcessFactory> = OnceLock::new();
        if let Some(factory) = GLOBAL.get() {
            return Ok(factory);
        }
        let factory = ProcessFactory::new(FactoryConfig::from_env()?);
        Ok(GLOBAL.get_or_init(|| factory))
    }

    /// Configuration in use
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Worker executable, resolved on first use.
    ///
    /// Lookup order: `workerPath` from the config, `STENCIL_WORKER`, a
    /// `stencil-worker` next to the current executable (or one directory up,
    /// which covers test binaries under `target/*/deps`), then `PATH`.
    pub fn worker_path(&self) -> Result<&Path> {
        if let Some(path) = self.worker_path.get() {
            return Ok(path);
        }
        let resolved = resolve_worker_path(&self.config)?;
        debug!("Resolved worker executable: {}", resolved.display());
        Ok(self.worker_path.get_or_init(|| resolved))
    }

    /// Start a new worker without going through the template.
    ///
    /// Forks the early template if one is installed; otherwise execs the
    /// worker binary. The handle carries the pid only in the exec case.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReactorUnavailable`] outside a Tokio runtime
    /// - [`CoreError::SpawnFailure`] if the worker cannot be started
    pub fn spawn_fresh(&self) -> Result<ProcessHandle> {
        if let Some(early) = lock(&self.early).as_ref() {
            debug!("Forking fresh worker from early template");
            return early.fork();
        }
        self.exec_worker()
    }

    fn exec_worker(&self) -> Result<ProcessHandle> {
        tokio::runtime::Handle::try_current().map_err(|_| CoreError::ReactorUnavailable)?;
        let program = self.worker_path()?.to_path_buf();
        let (local, remote) = UnixStream::pair()?;
        let remote_fd = remote.as_raw_fd();

        let request = SpawnRequest {
            program,
            args: vec![remote_fd.to_string(), std::process::id().to_string()],
            env: self.config.spawn_env(),
            inherit_fds: vec![remote_fd],
            new_session: self.config.new_session,
        };
        let spawned = self.spawner.spawn(&request)?;
        drop(remote);

        info!(
            "Spawned worker {} ({})",
            spawned.pid,
            request.program.display()
        );
        ProcessHandle::with_child(local, Some(spawned.pid), spawned.process)
    }

    /// Fork a new worker from the template, creating the template first if
    /// needed
    pub fn spawn_from_template(&self) -> Result<ProcessHandle> {
        let mut slot = lock(&self.template);
        if slot.is_none() {
            let template = self.spawn_fresh()?;
            info!("Created template worker {:?}", template.pid());
            *slot = Some(template);
        }
        match slot.as_ref() {
            Some(template) => template.fork(),
            None => Err(CoreError::SpawnFailure(
                "template worker unavailable".to_string(),
            )),
        }
    }

    /// Install `handle` as the early template
    ///
    /// Returns the previous early template, if any.
    pub fn install_early(&self, handle: ProcessHandle) -> Option<ProcessHandle> {
        lock(&self.early).replace(handle)
    }

    /// Exec a fresh worker and install it as the early template.
    ///
    /// Call this before the host process allocates much memory.
    pub fn spawn_early(&self) -> Result<()> {
        let handle = self.exec_worker()?;
        info!("Early template worker {:?} installed", handle.pid());
        if let Some(previous) = self.install_early(handle) {
            previous.destroy();
        }
        Ok(())
    }

    /// Drop the cached template; the next template spawn creates a new one
    ///
    /// The old template sees end of stream once its queue drains and exits.
    pub fn reset_template(&self) -> Option<ProcessHandle> {
        lock(&self.template).take()
    }

    /// Pid of the current template, if it is a direct child
    pub fn template_pid(&self) -> Option<u32> {
        lock(&self.template).as_ref().and_then(ProcessHandle::pid)
    }

    /// Whether an early template is installed
    pub fn has_early_template(&self) -> bool {
        lock(&self.early).is_some()
    }
}

fn resolve_worker_path(config: &FactoryConfig) -> Result<PathBuf> {
    if let Some(path) = &config.worker_path {
        return Ok(path.clone());
    }
    if let Some(path) = std::env::var_os(WORKER_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    if let Ok(exe) = std::env::current_exe() {
        let candidates = exe
            .parent()
            .into_iter()
            .flat_map(|dir| [Some(dir), dir.parent()])
            .flatten()
            .map(|dir| dir.join(WORKER_BIN));
        for candidate in candidates {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(WORKER_BIN);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(CoreError::Configuration(format!(
        "cannot locate {WORKER_BIN}; set {WORKER_ENV} or workerPath"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::MockSpawner;
    use ipc::{Frame, FrameReader};
    use std::os::fd::AsFd;

    fn factory(spawner: &MockSpawner) -> ProcessFactory {
        let config = FactoryConfig {
            worker_path: Some(PathBuf::from("/opt/stencil/stencil-worker")),
            env_passthrough: vec!["PATH".to_string()],
            ..FactoryConfig::default()
        };
        ProcessFactory::with_spawner(config, Arc::new(spawner.clone()))
    }

    #[tokio::test]
    async fn test_spawn_fresh_passes_fd_and_owner() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);
        let handle = factory.spawn_fresh().unwrap();

        let requests = spawner.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.program, PathBuf::from("/opt/stencil/stencil-worker"));
        assert_eq!(request.inherit_fds.len(), 1);
        assert_eq!(
            request.args,
            vec![
                request.inherit_fds[0].to_string(),
                std::process::id().to_string()
            ]
        );
        assert!(request.env.iter().all(|(k, _)| k == "PATH"));
        assert_eq!(handle.pid(), Some(40_000));
    }

    #[tokio::test]
    async fn test_template_is_created_once_and_forked() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);

        let first = factory.spawn_from_template().unwrap();
        let second = factory.spawn_from_template().unwrap();
        assert_eq!(spawner.requests().len(), 1);
        assert_eq!(factory.template_pid(), Some(40_000));
        assert!(first.pid().is_none());
        assert!(second.pid().is_none());

        let mut channels = spawner.take_channels();
        let mut peer = UnixStream::from(channels.remove(0));
        let mut reader = FrameReader::new();
        let forks = tokio::task::spawn_blocking(move || {
            let mut forks = 0;
            for _ in 0..2 {
                assert_eq!(reader.read_frame(&mut peer).unwrap(), Frame::Handle);
                ipc::fdpass::recv_fd(peer.as_fd()).unwrap();
                assert_eq!(reader.read_frame(&mut peer).unwrap(), Frame::Fork);
                forks += 1;
            }
            forks
        })
        .await
        .unwrap();
        assert_eq!(forks, 2);
    }

    #[tokio::test]
    async fn test_early_template_replaces_exec() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);
        factory.spawn_early().unwrap();
        assert!(factory.has_early_template());
        assert_eq!(spawner.requests().len(), 1);

        let fresh = factory.spawn_fresh().unwrap();
        let templated = factory.spawn_from_template().unwrap();
        assert_eq!(spawner.requests().len(), 1);
        assert!(fresh.pid().is_none());
        assert!(templated.pid().is_none());
        assert!(factory.template_pid().is_none());
    }

    #[tokio::test]
    async fn test_reset_template_spawns_again() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);
        factory.spawn_from_template().unwrap();
        assert!(factory.reset_template().is_some());
        factory.spawn_from_template().unwrap();
        assert_eq!(spawner.requests().len(), 2);
        assert_eq!(factory.template_pid(), Some(40_001));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let spawner = MockSpawner::failing();
        let factory = factory(&spawner);
        assert!(matches!(
            factory.spawn_from_template(),
            Err(CoreError::SpawnFailure(_))
        ));
        assert!(factory.template_pid().is_none());
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);
        assert!(matches!(
            factory.spawn_fresh(),
            Err(CoreError::ReactorUnavailable)
        ));
        assert!(spawner.requests().is_empty());
    }

    #[test]
    fn test_configured_worker_path_wins() {
        let spawner = MockSpawner::new();
        let factory = factory(&spawner);
        assert_eq!(
            factory.worker_path().unwrap(),
            Path::new("/opt/stencil/stencil-worker")
        );
    }
}
