//! Test utilities for integration tests in the worker crate.

#![allow(dead_code)]

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use stencil_core::{FactoryConfig, ProcessFactory, ProcessHandle};
use tokio::sync::oneshot;

/// Run the given future with a timeout, failing the test if it elapses.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// Run a future with a default timeout of 30 seconds.
pub async fn run_with_default_timeout<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    run_with_timeout(Duration::from_secs(30), fut).await
}

/// Path of the worker binary built for this test run
pub fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stencil-worker"))
}

/// Factory that execs the freshly built worker binary
pub fn factory() -> ProcessFactory {
    let config = FactoryConfig {
        worker_path: Some(worker_bin()),
        ..FactoryConfig::default()
    };
    ProcessFactory::new(config)
}

/// Queue `run(entry)` and collect everything the entry point writes back
/// until it closes the socket.
pub async fn run_and_collect(handle: &ProcessHandle, entry: &str) -> String {
    let (tx, rx) = oneshot::channel();
    handle
        .run(entry, move |socket| {
            let _ = tx.send(socket);
        })
        .expect("run could not be queued");

    let socket = run_with_default_timeout(rx)
        .await
        .expect("ready callback dropped");
    read_to_end(socket).await
}

/// Read a handed-over socket to EOF on a blocking thread
pub async fn read_to_end(socket: UnixStream) -> String {
    let read = tokio::task::spawn_blocking(move || {
        let mut socket = socket;
        socket.set_nonblocking(false)?;
        let mut out = String::new();
        socket.read_to_string(&mut out)?;
        Ok::<_, std::io::Error>(out)
    });
    run_with_default_timeout(read)
        .await
        .expect("reader panicked")
        .expect("reading from worker failed")
}
