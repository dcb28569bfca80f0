//! Process Builder - Command, Environment and Working Directory for a Spawn
//!
//! ```no_run
//! use procplex::{NullListener, ProcessBuilder};
//!
//! let handle = ProcessBuilder::new(["/bin/echo", "hello"])
//!     .env("LANG", "C")
//!     .try_start(NullListener)?;
//! assert_eq!(handle.wait_for(), 0);
//! # Ok::<(), procplex::SpawnError>(())
//! ```

use crate::error::SpawnError;
use crate::listener::{ProcessListener, EXIT_LAUNCH_FAILURE};
use crate::pool::ProcessPool;
use crate::processor::EventProcessor;
use crate::process::launch::{self, Launch, Spawned};
use crate::process::{Process, ProcessHandle};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Configures and launches one child process.
///
/// The environment starts as a copy of the current process's environment.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    command: Vec<OsString>,
    env: HashMap<OsString, OsString>,
    cwd: Option<PathBuf>,
    pool: Option<ProcessPool>,
}

impl ProcessBuilder {
    /// `command` is the program followed by its arguments.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: std::env::vars_os().collect(),
            cwd: None,
            pool: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.command.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env.remove(&key.into());
        self
    }

    /// Start the child with an empty environment, apart from later `env` calls.
    pub fn env_clear(mut self) -> Self {
        self.env.clear();
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Serve the child from `pool` instead of [`ProcessPool::global`].
    pub fn pool(mut self, pool: ProcessPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn command(&self) -> &[OsString] {
        &self.command
    }

    /// Assign a processor, then launch. The processor is assigned first so a
    /// failure to start its loop never leaves a launched child behind.
    fn prepare(self) -> Result<(Spawned, Arc<EventProcessor>, usize), SpawnError> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => ProcessPool::global().clone(),
        };
        let processor = pool.assign_processor()?;
        let spawned = launch::spawn(&Launch {
            command: self.command,
            env: self.env,
            cwd: self.cwd,
        })?;
        Ok((spawned, processor, pool.config().buffer_capacity))
    }

    /// Launch the child and hand it to an event processor.
    ///
    /// On success `listener.on_start` has already run. On failure the
    /// listener is dropped without any callback.
    pub fn try_start<L: ProcessListener>(self, listener: L) -> Result<ProcessHandle, SpawnError> {
        let (spawned, processor, capacity) = self.prepare()?;
        Ok(Process::attach(spawned, processor, Box::new(listener), capacity))
    }

    /// Launch the child, reporting failure through the listener.
    ///
    /// If the child cannot be launched, `listener.on_exit` receives
    /// [`EXIT_LAUNCH_FAILURE`] and `None` is returned.
    pub fn start<L: ProcessListener>(self, mut listener: L) -> Option<ProcessHandle> {
        let program = self
            .command
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.prepare() {
            Ok((spawned, processor, capacity)) => {
                Some(Process::attach(spawned, processor, Box::new(listener), capacity))
            }
            Err(err) => {
                warn!(program = %program, error = %err, "Failed to start process");
                listener.on_exit(EXIT_LAUNCH_FAILURE);
                None
            }
        }
    }
}
