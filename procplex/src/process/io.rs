//! Raw non-blocking reads and writes, invoked only by the owning processor.

use super::{IoState, Process, Stream};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Result of one read attempt on stdout or stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// `n` bytes were delivered to the listener.
    Data(usize),
    /// Nothing to read right now; re-arm and wait.
    WouldBlock,
    /// The stream is closed; the listener has seen the empty buffer.
    Closed,
}

/// Result of one stdin service cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Bytes remain in the buffer; keep requesting write readiness.
    WantMore,
    /// The buffer is empty; request readiness again only if write interest
    /// is still set.
    Idle,
    /// stdin is closed.
    Closed,
}

impl Process {
    /// Issue one non-blocking read on `stream` and deliver the result.
    ///
    /// EOF and hard errors both close the stream and deliver an empty buffer.
    /// Once the exit state has resolved no further reads are issued.
    pub(crate) fn read_output(&self, stream: Stream) -> ReadOutcome {
        if self.exit.is_resolved() {
            self.close_output(stream, true);
            return ReadOutcome::Closed;
        }

        let mut io = self.io.lock();
        let IoState {
            stdout,
            stderr,
            output,
            ..
        } = &mut *io;
        let pipe = match stream {
            Stream::Stdout => stdout.as_mut(),
            Stream::Stderr => stderr.as_mut(),
            Stream::Stdin => None,
        };
        let Some(pipe) = pipe else {
            return ReadOutcome::Closed;
        };

        match pipe.read(output.prepare_read()) {
            Ok(0) => {
                trace!(pid = self.pid, ?stream, "EOF");
            }
            Ok(n) => {
                output.set_filled(n);
                trace!(pid = self.pid, ?stream, bytes = n, "Read");
                self.processor.stats().record_read(stream, n);
                let delivered = output.as_slice();
                self.with_listener(|l| match stream {
                    Stream::Stderr => l.on_stderr(delivered),
                    _ => l.on_stdout(delivered),
                });
                return ReadOutcome::Data(n);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return ReadOutcome::WouldBlock;
            }
            Err(err) => {
                debug!(pid = self.pid, ?stream, error = %err, "Read failed, closing stream");
            }
        }

        drop(io);
        self.close_output(stream, true);
        ReadOutcome::Closed
    }

    /// Read `stream` until it would block or closes.
    pub(crate) fn drain_output(&self, stream: Stream) {
        while let ReadOutcome::Data(_) = self.read_output(stream) {}
    }

    /// Deregister and drop `stream`, optionally delivering the empty buffer
    /// that signals closure. Returns `false` if it was already closed.
    pub(crate) fn close_output(&self, stream: Stream, notify: bool) -> bool {
        let mut io = self.io.lock();
        let pipe = match stream {
            Stream::Stdout => io.stdout.take(),
            Stream::Stderr => io.stderr.take(),
            Stream::Stdin => None,
        };
        let Some(pipe) = pipe else {
            return false;
        };

        if let Err(err) = self.processor.poller().deregister(pipe.as_fd()) {
            debug!(pid = self.pid, ?stream, error = %err, "Failed to deregister stream");
        }
        drop(pipe);
        debug!(pid = self.pid, ?stream, "Stream closed");

        if notify {
            self.with_listener(|l| match stream {
                Stream::Stderr => l.on_stderr(&[]),
                _ => l.on_stdout(&[]),
            });
        }
        true
    }

    /// Service a writable stdin: drain the buffer, refilling it from the
    /// listener whenever it runs empty.
    pub(crate) fn write_stdin(&self) -> WriteOutcome {
        if self.exit.is_resolved() {
            self.close_stdin();
            return WriteOutcome::Closed;
        }

        let mut io = self.io.lock();
        loop {
            if io.input.is_draining() {
                let written = {
                    let stdin = self.stdin.lock();
                    match stdin.as_ref() {
                        Some(mut pipe) => pipe.write(io.input.pending()),
                        None => {
                            io.input.clear();
                            return WriteOutcome::Closed;
                        }
                    }
                };

                match written {
                    Ok(n) => {
                        let pending = io.input.len();
                        io.input.advance(n);
                        self.processor.stats().record_written(n);
                        trace!(pid = self.pid, bytes = n, pending, "Wrote stdin");
                        if n < pending {
                            return WriteOutcome::WantMore;
                        }
                        if io.input_finished {
                            drop(io);
                            self.close_stdin();
                            return WriteOutcome::Closed;
                        }
                        return WriteOutcome::Idle;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return WriteOutcome::WantMore;
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(pid = self.pid, error = %err, "Write failed, closing stdin");
                        io.input.clear();
                        drop(io);
                        self.close_stdin();
                        return WriteOutcome::Closed;
                    }
                }
            }

            if io.input_finished {
                drop(io);
                self.close_stdin();
                return WriteOutcome::Closed;
            }

            let io = &mut *io;
            io.input.clear();
            let more = self
                .with_listener(|l| l.on_stdin_ready(&mut io.input))
                .unwrap_or(false);

            if !more {
                io.input_finished = true;
                // Drain whatever was supplied with the final refill.
                continue;
            }
            if io.input.is_empty() {
                self.withdraw_write();
                return WriteOutcome::Idle;
            }
            // Supplying bytes and asking for more keeps write interest alive.
            self.want_write.store(true, Ordering::SeqCst);
        }
    }
}
