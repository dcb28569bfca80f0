//! Launch glue: turns a command line and environment into a running child
//! with three non-blocking pipe descriptors.
//!
//! Argument and environment marshaling is left to `std::process::Command`,
//! which performs fork/exec (or posix_spawn) and reports exec failures such
//! as a missing program synchronously. The pipes are converted into plain
//! `File`s so stdin, stdout and stderr share one I/O type.

use crate::error::SpawnError;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Everything needed to launch one child.
#[derive(Debug, Clone, Default)]
pub(crate) struct Launch {
    /// Program path followed by its arguments.
    pub(crate) command: Vec<OsString>,
    /// Complete environment of the child.
    pub(crate) env: HashMap<OsString, OsString>,
    /// Working directory; inherited when `None`.
    pub(crate) cwd: Option<PathBuf>,
}

impl Launch {
    pub(crate) fn program_name(&self) -> String {
        self.command
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A freshly launched child and its non-blocking pipe ends.
#[derive(Debug)]
pub(crate) struct Spawned {
    pub(crate) child: Child,
    pub(crate) stdin: File,
    pub(crate) stdout: File,
    pub(crate) stderr: File,
}

/// Launch `launch` and switch every pipe to non-blocking mode.
///
/// On failure no pipe stays open: anything already created is dropped, and a
/// child that did start is killed and reaped.
pub(crate) fn spawn(launch: &Launch) -> Result<Spawned, SpawnError> {
    let (program, args) = launch.command.split_first().ok_or(SpawnError::EmptyCommand)?;
    let name = launch.program_name();
    if program.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(&launch.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &launch.cwd {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|source| SpawnError::from_io(name.clone(), source))?;

    match take_pipes(&mut child) {
        Ok((stdin, stdout, stderr)) => {
            debug!(pid = child.id(), program = %name, "Launched child");
            Ok(Spawned {
                child,
                stdin,
                stdout,
                stderr,
            })
        }
        Err(source) => {
            discard(&mut child);
            Err(SpawnError::Io {
                program: name,
                source,
            })
        }
    }
}

fn take_pipes(child: &mut Child) -> std::io::Result<(File, File, File)> {
    let missing = || std::io::Error::other("child pipe was not captured");

    let stdin = File::from(OwnedFd::from(child.stdin.take().ok_or_else(missing)?));
    let stdout = File::from(OwnedFd::from(child.stdout.take().ok_or_else(missing)?));
    let stderr = File::from(OwnedFd::from(child.stderr.take().ok_or_else(missing)?));

    for pipe in [&stdin, &stdout, &stderr] {
        set_nonblocking(pipe.as_raw_fd())?;
    }
    Ok((stdin, stdout, stderr))
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn discard(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(pid = child.id(), error = %err, "Failed to kill half-launched child");
    }
    let _ = child.wait();
}
