#![allow(unused_crate_dependencies)]
//! Parent side of the Stencil worker protocol
//!
//! This crate creates worker processes and prepares them over a control
//! socket before handing them off to a named entry point:
//!
//! - [`ProcessFactory`] starts workers, preferably by forking a template
//! - [`ProcessHandle`] queues commands (`eval`, `send_arg`, `send_fh`, `fork`,
//!   `run`) and drains them in order on the Tokio runtime
//! - [`WriteQueue`] is the underlying ordered, resumable transmitter
//!
//! The worker side lives in the `worker` crate; the wire format in `ipc`.

pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod process;
pub mod queue;
pub mod spawner;


pub use config::FactoryConfig;
pub use error::{CoreError, Result};
pub use factory::ProcessFactory;
pub use handle::{HandleStatus, ProcessHandle, ReadyCallback};
pub use queue::{Flush, QueueItem, Transport, WriteQueue};
pub use spawner::{CommandSpawner, MockSpawner, ProcessSpawner, SpawnRequest, SpawnedChild};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level`. Output goes to stderr.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::Initialization(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }

    /// Initialize tracing from a factory configuration
    pub fn init_tracing_from_config(config: &crate::FactoryConfig) -> crate::Result<()> {
        init_tracing(&config.log_level)
    }
}
