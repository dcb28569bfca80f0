//! Process Listener - Lifecycle and Data Callbacks
//!
//! A [`ProcessListener`] is supplied once per spawn and observes the child
//! without polling. Apart from `on_start`, which runs on the spawning thread
//! before `start` returns, every callback runs on the event-processor thread
//! that owns the process, so callbacks should return quickly and must never
//! block on [`ProcessHandle::wait_for`] of a process served by the same
//! processor.
//!
//! # Callback order:
//! ```text
//! on_start ─┬─> on_stdout* ──> on_stdout(&[])   (stdout closed)
//!           ├─> on_stderr* ──> on_stderr(&[])   (stderr closed)
//!           ├─> on_stdin_ready* -> false         (stdin closed)
//!           └─> on_exit(code)                    (terminal, exactly once)
//! ```

use crate::buffer::StdinBuffer;
use crate::process::ProcessHandle;

/// Exit code reported when the process could not be started, or when its
/// status could not be determined.
pub const EXIT_LAUNCH_FAILURE: i32 = i32::MIN;

/// Exit code reported when the process was terminated by a signal.
pub const EXIT_ABNORMAL: i32 = -1;

/// Capability set a caller implements to follow a child process.
///
/// Every method has a no-op default, so implementors override only what they
/// need. The listener is dropped right after `on_exit`.
pub trait ProcessListener: Send + 'static {
    /// The process was spawned. Runs on the spawning thread, before any other
    /// callback. A good place to keep a clone of `process` and to call
    /// [`ProcessHandle::want_write`].
    fn on_start(&mut self, _process: &ProcessHandle) {}

    /// Bytes read from the child's stdout. An empty slice means stdout closed.
    fn on_stdout(&mut self, _buffer: &[u8]) {}

    /// Bytes read from the child's stderr. An empty slice means stderr closed.
    fn on_stderr(&mut self, _buffer: &[u8]) {}

    /// The stdin buffer is empty and stdin is writable.
    ///
    /// Fill `buffer` with [`StdinBuffer::put`] and return `true` if more data
    /// may follow, or `false` to close stdin once the supplied bytes are
    /// written. Returning `true` without supplying any bytes withdraws write
    /// interest until [`ProcessHandle::want_write`] is called again.
    fn on_stdin_ready(&mut self, _buffer: &mut StdinBuffer) -> bool {
        false
    }

    /// The process exited. `exit_code` is the real exit status, or one of
    /// [`EXIT_LAUNCH_FAILURE`] and [`EXIT_ABNORMAL`].
    fn on_exit(&mut self, _exit_code: i32) {}
}

/// Listener that ignores every event and closes stdin on first request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ProcessListener for NullListener {}

/// Translate an OS exit status into the listener's exit-code convention.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_ABNORMAL)
}
