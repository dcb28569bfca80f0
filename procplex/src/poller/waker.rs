//! Self-pipe used to interrupt a processor blocked in its readiness wait.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

#[derive(Debug)]
pub(crate) struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    pub(crate) fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Make the next (or current) wait return. A full socket buffer already
    /// guarantees that, so `WouldBlock` is ignored.
    pub(crate) fn wake(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => tracing::warn!(error = %err, "Failed to wake event processor"),
        }
    }

    pub(crate) fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            match (&self.reader).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}
