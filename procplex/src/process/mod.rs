//! Process Handle - One Child, Its Descriptors, Buffers and Exit State
//!
//! A [`ProcessHandle`] is the caller's view of a spawned child. Behind it sits
//! a `Process` shared with the event processor that serves the child:
//!
//! - stdout/stderr, the output buffer and the stdin buffer are touched only
//!   by the owning processor's loop thread;
//! - stdin's descriptor, the write-interest flag, the exit state and the child
//!   handle are shared with caller threads and synchronized individually.
//!
//! # Lock order:
//! `io` → `listener` → `stdin`, and `child` is always taken alone. Caller
//! threads never take `io`.

mod exit;
mod io;
pub(crate) mod launch;

pub(crate) use io::{ReadOutcome, WriteOutcome};

use crate::buffer::{OutputBuffer, StdinBuffer};
use crate::listener::{exit_code_of, ProcessListener, EXIT_ABNORMAL, EXIT_LAUNCH_FAILURE};
use crate::poller::{Interest, Poller};
use crate::processor::EventProcessor;
use exit::ExitSignal;
use launch::Spawned;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::os::fd::AsFd;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of process tokens; unique across every processor.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One of a child's three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Stream {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl Stream {
    /// Readiness token for this stream of the process identified by `token`.
    pub(crate) fn token(self, token: u64) -> u64 {
        (token << 2) | self as u64
    }

    /// Split a readiness token into process token and stream.
    pub(crate) fn decode(token: u64) -> Option<(u64, Stream)> {
        let stream = match token & 0b11 {
            0 => Stream::Stdin,
            1 => Stream::Stdout,
            2 => Stream::Stderr,
            _ => return None,
        };
        Some((token >> 2, stream))
    }
}

/// Loop-owned I/O state.
#[derive(Debug)]
pub(crate) struct IoState {
    pub(crate) stdout: Option<File>,
    pub(crate) stderr: Option<File>,
    pub(crate) output: OutputBuffer,
    pub(crate) input: StdinBuffer,
    /// The listener declined further input; close stdin once `input` drains.
    pub(crate) input_finished: bool,
}

pub(crate) struct Process {
    token: u64,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<File>>,
    io: Mutex<IoState>,
    want_write: AtomicBool,
    exit: ExitSignal,
    exit_notified: AtomicBool,
    listener: Mutex<Option<Box<dyn ProcessListener>>>,
    processor: Arc<EventProcessor>,
}

impl Process {
    /// Wrap a launched child, notify `on_start`, and hand it to `processor`.
    ///
    /// `on_start` runs before the processor can see the process, so it always
    /// precedes every I/O callback.
    pub(crate) fn attach(
        spawned: Spawned,
        processor: Arc<EventProcessor>,
        listener: Box<dyn ProcessListener>,
        buffer_capacity: usize,
    ) -> ProcessHandle {
        let Spawned {
            child,
            stdin,
            stdout,
            stderr,
        } = spawned;

        let process = Arc::new(Process {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            io: Mutex::new(IoState {
                stdout: Some(stdout),
                stderr: Some(stderr),
                output: OutputBuffer::new(buffer_capacity),
                input: StdinBuffer::new(buffer_capacity),
                input_finished: false,
            }),
            want_write: AtomicBool::new(false),
            exit: ExitSignal::new(),
            exit_notified: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
            processor: processor.clone(),
        });
        let handle = ProcessHandle {
            inner: process.clone(),
        };

        if let Some(listener) = process.listener.lock().as_mut() {
            listener.on_start(&handle);
        }

        processor.register_process(&process);
        debug!(pid = process.pid, processor = processor.id(), "Process started");
        handle
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.want_write.load(Ordering::SeqCst)
    }

    pub(crate) fn want_write(&self) {
        self.want_write.store(true, Ordering::SeqCst);
        self.processor.queue_write(self);
    }

    pub(crate) fn withdraw_write(&self) {
        self.want_write.store(false, Ordering::SeqCst);
    }

    /// Arm one-shot write readiness for stdin. Returns `false` once stdin is closed.
    pub(crate) fn arm_stdin(&self, poller: &Poller) -> bool {
        let stdin = self.stdin.lock();
        match stdin.as_ref() {
            Some(pipe) => {
                if let Err(err) = poller.arm(pipe.as_fd(), Stream::Stdin.token(self.token), Interest::Write) {
                    warn!(pid = self.pid, error = %err, "Failed to arm stdin write readiness");
                }
                true
            }
            None => false,
        }
    }

    /// Arm one-shot read readiness for stdout or stderr.
    pub(crate) fn arm_output(&self, poller: &Poller, stream: Stream) -> std::io::Result<()> {
        let io = self.io.lock();
        let pipe = match stream {
            Stream::Stdout => io.stdout.as_ref(),
            Stream::Stderr => io.stderr.as_ref(),
            Stream::Stdin => None,
        };
        match pipe {
            Some(pipe) => poller.arm(pipe.as_fd(), stream.token(self.token), Interest::Read),
            None => Ok(()),
        }
    }

    /// `true` once both stdout and stderr have been closed.
    pub(crate) fn output_closed(&self) -> bool {
        let io = self.io.lock();
        io.stdout.is_none() && io.stderr.is_none()
    }

    /// Close stdin exactly once and withdraw write interest.
    pub(crate) fn close_stdin(&self) {
        self.withdraw_write();
        let pipe = self.stdin.lock().take();
        if let Some(pipe) = pipe {
            if let Err(err) = self.processor.poller().deregister(pipe.as_fd()) {
                debug!(pid = self.pid, error = %err, "Failed to deregister stdin");
            }
            drop(pipe);
            debug!(pid = self.pid, "Closed stdin");
        }
    }

    /// Non-blocking check for termination of the child.
    pub(crate) fn try_reap(&self) -> Option<i32> {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => Some(exit_code_of(status)),
            Ok(None) => None,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "Exit status of child is unavailable");
                Some(EXIT_LAUNCH_FAILURE)
            }
        }
    }

    pub(crate) fn destroy(&self) {
        let killed = self.child.lock().kill();
        match killed {
            Ok(()) => {
                debug!(pid = self.pid, "Sent SIGKILL to child");
                self.exit.resolve(EXIT_ABNORMAL);
            }
            Err(err) => {
                warn!(pid = self.pid, error = %err, "Failed to terminate child");
                self.exit.resolve(EXIT_LAUNCH_FAILURE);
            }
        }
    }

    /// Resolve the exit state, release every descriptor, and deliver `on_exit`
    /// exactly once. The listener is dropped afterwards.
    pub(crate) fn finish(&self, code: i32) {
        self.exit.resolve(code);
        self.close_stdin();
        self.close_output(Stream::Stdout, false);
        self.close_output(Stream::Stderr, false);

        if self.exit_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self.listener.lock().take();
        if let Some(mut listener) = listener {
            let code = self.exit.code().unwrap_or(code);
            listener.on_exit(code);
        }
    }

    /// Stop delivering callbacks to a listener that panicked: kill the child,
    /// close every stream silently and drop the listener.
    pub(crate) fn abandon(&self) {
        self.exit_notified.store(true, Ordering::SeqCst);
        self.destroy();
        self.close_stdin();
        self.close_output(Stream::Stdout, false);
        self.close_output(Stream::Stderr, false);
        let listener = self.listener.lock().take();
        drop(listener);
    }

    /// Called when no loop will ever serve this process: kill and reap the
    /// child, then deliver `on_exit(EXIT_LAUNCH_FAILURE)` on the caller's thread.
    pub(crate) fn fail_hand_off(&self) {
        {
            let mut child = self.child.lock();
            if let Err(err) = child.kill() {
                debug!(pid = self.pid, error = %err, "Failed to kill unserved child");
            }
            let _ = child.wait();
        }
        warn!(pid = self.pid, processor = self.processor.id(), "No event processor loop, abandoning child");
        self.finish(EXIT_LAUNCH_FAILURE);
    }

    fn with_listener<R>(&self, f: impl FnOnce(&mut dyn ProcessListener) -> R) -> Option<R> {
        let mut listener = self.listener.lock();
        listener.as_mut().map(|l| f(l.as_mut()))
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("token", &self.token)
            .field("exit", &self.exit.code())
            .finish_non_exhaustive()
    }
}

/// Caller-facing handle to a spawned child. Cheap to clone.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Process>,
}

impl ProcessHandle {
    /// Spawn `command` with `env` on the global pool.
    ///
    /// Fails with [`SpawnError`](crate::SpawnError) without notifying
    /// `listener` when the child cannot be launched.
    pub fn start<I, S>(
        command: I,
        env: std::collections::HashMap<std::ffi::OsString, std::ffi::OsString>,
        listener: impl ProcessListener,
    ) -> Result<Self, crate::SpawnError>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        crate::ProcessBuilder::new(command).env_clear().envs(env).try_start(listener)
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> u64 {
        self.inner.token
    }

    /// Index of the event processor serving this process.
    pub fn processor_id(&self) -> usize {
        self.inner.processor.id()
    }

    /// Block until the exit state resolves and return the exit code.
    pub fn wait_for(&self) -> i32 {
        self.inner.exit.wait()
    }

    /// Like [`wait_for`](Self::wait_for), giving up after `timeout`.
    pub fn wait_for_timeout(&self, timeout: Duration) -> Option<i32> {
        self.inner.exit.wait_timeout(timeout)
    }

    /// The exit code if the exit state has resolved.
    pub fn try_exit_code(&self) -> Option<i32> {
        self.inner.exit.code()
    }

    /// `true` until the exit state resolves.
    pub fn is_running(&self) -> bool {
        !self.inner.exit.is_resolved()
    }

    /// Declare intent to write; the listener's `on_stdin_ready` will be called
    /// when stdin becomes writable.
    pub fn want_write(&self) {
        self.inner.want_write();
    }

    /// Close the child's stdin. Safe to call repeatedly.
    pub fn stdin_close(&self) {
        self.inner.close_stdin();
    }

    /// Forcibly terminate the child.
    ///
    /// Never fails; waiters are released even if the kill could not be
    /// confirmed, in which case the exit code is [`EXIT_LAUNCH_FAILURE`].
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("processor", &self.inner.processor.id())
            .field("exit", &self.inner.exit.code())
            .finish()
    }
}
