//! Procplex - Child Process Stdio Multiplexing
//!
//! Spawns child processes and drives their stdin, stdout and stderr through a
//! small pool of event-processor threads instead of one thread per stream.
//! Callers observe each child through a [`ProcessListener`].
//!
//! # Architecture:
//! - [`ProcessPool`]: fixed set of [`EventProcessor`]s, assigned round-robin
//! - [`EventProcessor`]: one readiness loop (epoll or kqueue) per worker thread
//! - [`ProcessHandle`]: one child, its descriptors, buffers and exit state
//! - [`ProcessListener`]: lifecycle and data callbacks, run on the loop thread
//!
//! ```no_run
//! use procplex::{ProcessBuilder, ProcessListener};
//!
//! struct Print;
//!
//! impl ProcessListener for Print {
//!     fn on_stdout(&mut self, buffer: &[u8]) {
//!         print!("{}", String::from_utf8_lossy(buffer));
//!     }
//! }
//!
//! let handle = ProcessBuilder::new(["/bin/ls", "-l"]).try_start(Print)?;
//! let code = handle.wait_for();
//! # Ok::<(), procplex::SpawnError>(())
//! ```

pub mod buffer;
pub mod builder;
pub mod config;
pub mod error;
pub mod listener;
mod poller;
pub mod pool;
pub mod process;
pub mod processor;
pub mod stats;
pub mod stream;

pub use buffer::{OutputBuffer, StdinBuffer};
pub use builder::ProcessBuilder;
pub use config::PoolConfig;
pub use error::SpawnError;
pub use listener::{NullListener, ProcessListener, EXIT_ABNORMAL, EXIT_LAUNCH_FAILURE};
pub use pool::ProcessPool;
pub use process::ProcessHandle;
pub use processor::{EventProcessor, SpawnBarrier};
pub use stats::{PoolStatsSnapshot, StatsSnapshot};
pub use stream::{spawn_streaming, CollectedOutput, ProcessEvent, StdinWriter, StreamingProcess};

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const ENV_LOG: &str = "PROCPLEX_LOG";

/// Install a stderr `fmt` subscriber filtered by `PROCPLEX_LOG`.
///
/// Falls back to `warn`. Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
