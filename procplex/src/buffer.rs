//! Fixed-Capacity Process I/O Buffers
//!
//! Each process handle owns exactly two buffers, allocated once at spawn:
//!
//! - an [`OutputBuffer`], filled fresh by every stdout/stderr read and handed
//!   to the listener as a slice of exactly the bytes that read returned;
//! - a [`StdinBuffer`], which alternates between *draining* (bytes supplied by
//!   the listener that the child has not consumed yet) and *empty* (waiting
//!   for the listener to refill it).
//!
//! Neither buffer ever grows, so the hot read/write path never touches the
//! allocator after spawn.

use tracing::trace;

/// Read buffer shared in rotation by a process's stdout and stderr.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Box<[u8]>,
    /// Bytes produced by the most recent read.
    len: usize,
}

impl OutputBuffer {
    /// Allocate a buffer holding at most `capacity` bytes per read.
    pub fn new(capacity: usize) -> Self {
        trace!(capacity, "Allocating OutputBuffer");
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Discard the previous read and expose the whole region for the next one.
    pub(crate) fn prepare_read(&mut self) -> &mut [u8] {
        self.len = 0;
        &mut self.data
    }

    /// Record how many bytes the last read placed in the buffer.
    pub(crate) fn set_filled(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    /// The bytes produced by the most recent read.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Buffer of bytes waiting to be written to a child's stdin.
///
/// Listeners see this buffer only when it is empty, from
/// [`ProcessListener::on_stdin_ready`](crate::listener::ProcessListener::on_stdin_ready),
/// and fill it with [`put`](Self::put). The event processor then drains it
/// across as many non-blocking writes as the pipe needs.
#[derive(Debug)]
pub struct StdinBuffer {
    data: Box<[u8]>,
    /// First byte not yet written to the child.
    start: usize,
    /// One past the last byte supplied by the listener.
    end: usize,
}

impl StdinBuffer {
    /// Allocate an empty buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        trace!(capacity, "Allocating StdinBuffer");
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Append as much of `src` as fits and return the number of bytes copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Free space left for [`put`](Self::put).
    pub fn remaining(&self) -> usize {
        self.data.len() - self.end
    }

    /// Number of supplied bytes not yet written to the child.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// `true` while unwritten bytes remain.
    pub(crate) fn is_draining(&self) -> bool {
        self.start < self.end
    }

    /// The slice the next write should attempt.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Mark `n` pending bytes as written; an exhausted buffer becomes empty.
    pub(crate) fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.clear();
        }
    }

    /// Reset to the empty state, keeping the allocation.
    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_new() {
        let buf = OutputBuffer::new(1024);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.as_slice(), b"");
    }

    #[test]
    fn test_output_buffer_reflects_last_read_only() {
        let mut buf = OutputBuffer::new(16);
        buf.prepare_read()[..5].copy_from_slice(b"first");
        buf.set_filled(5);
        assert_eq!(buf.as_slice(), b"first");

        let region = buf.prepare_read();
        assert_eq!(region.len(), 16);
        region[..2].copy_from_slice(b"ab");
        buf.set_filled(2);
        assert_eq!(buf.as_slice(), b"ab");
    }

    #[test]
    fn test_output_buffer_prepare_clears_len() {
        let mut buf = OutputBuffer::new(8);
        buf.set_filled(8);
        buf.prepare_read();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stdin_put_respects_capacity() {
        let mut buf = StdinBuffer::new(8);
        assert_eq!(buf.put(b"hello"), 5);
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.put(b"world"), 3);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.pending(), b"hellowor");
        assert_eq!(buf.put(b"!"), 0);
    }

    #[test]
    fn test_stdin_partial_drain() {
        let mut buf = StdinBuffer::new(16);
        buf.put(b"0123456789");
        assert!(buf.is_draining());

        buf.advance(4);
        assert_eq!(buf.pending(), b"456789");
        assert_eq!(buf.len(), 6);
        assert!(buf.is_draining());

        buf.advance(6);
        assert!(!buf.is_draining());
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 16);
    }

    #[test]
    fn test_stdin_advance_past_end_clamps() {
        let mut buf = StdinBuffer::new(4);
        buf.put(b"ab");
        buf.advance(10);
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 4);
    }
}
