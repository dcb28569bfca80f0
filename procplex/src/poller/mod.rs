//! Readiness Poller - Platform Multiplexing Behind One Interface
//!
//! Each event processor owns one poller. Registrations are one-shot: after a
//! descriptor reports readiness it stays silent until armed again. The only
//! exception is the waker, which is level-triggered and drained by the loop.
//!
//! Arming and deregistering take `&self` and may be called from any thread;
//! the kernel context serializes them against a concurrent wait.
//!
//! The backend is selected at compile time:
//! - Linux and Android: epoll
//! - macOS and the BSDs: kqueue

mod waker;

pub(crate) use waker::Waker;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::{Events, Poller};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::{Events, Poller};

use std::time::Duration;

/// Token reserved for the waker's read end.
pub(crate) const WAKER_TOKEN: u64 = u64::MAX;

/// Direction a descriptor is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// The peer end of the pipe is gone.
    pub(crate) hangup: bool,
    pub(crate) error: bool,
}

/// Milliseconds to block for, rounding up so short waits never spin.
fn timeout_millis(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| {
        let millis = t.as_millis();
        let rounded = if Duration::from_millis(millis as u64) < t {
            millis + 1
        } else {
            millis
        };
        rounded.min(i32::MAX as u128) as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_millis(None), None);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), Some(0));
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), Some(1));
        assert_eq!(timeout_millis(Some(Duration::from_millis(10))), Some(10));
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), Some(i32::MAX as u64));
    }

    #[test]
    fn test_wait_times_out_without_events() {
        let poller = Poller::new().unwrap();
        let mut events = Events::with_capacity(8);
        let n = poller.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
        assert_eq!(events.iter().count(), 0);
    }

    #[test]
    fn test_read_readiness_is_one_shot() {
        let poller = Poller::new().unwrap();
        let (mut writer, reader) = pair();
        let mut events = Events::with_capacity(8);

        poller.arm(reader.as_fd(), 42, Interest::Read).unwrap();
        writer.write_all(b"x").unwrap();

        poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        let ready: Vec<_> = events.iter().collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, 42);
        assert!(ready[0].readable);

        // Data is still unread, but the registration fired once.
        let n = poller.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(n, 0);

        poller.arm(reader.as_fd(), 42, Interest::Read).unwrap();
        let n = poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_write_readiness() {
        let poller = Poller::new().unwrap();
        let (writer, _reader) = pair();
        let mut events = Events::with_capacity(8);

        poller.arm(writer.as_fd(), 7, Interest::Write).unwrap();
        poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        let ready: Vec<_> = events.iter().collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, 7);
        assert!(ready[0].writable);
    }

    #[test]
    fn test_deregister_silences_descriptor() {
        let poller = Poller::new().unwrap();
        let (mut writer, reader) = pair();
        let mut events = Events::with_capacity(8);

        poller.arm(reader.as_fd(), 1, Interest::Read).unwrap();
        poller.deregister(reader.as_fd()).unwrap();
        // Deregistering twice is not an error.
        poller.deregister(reader.as_fd()).unwrap();
        writer.write_all(b"x").unwrap();

        let n = poller.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        poller.register_waker(&waker).unwrap();
        let mut events = Events::with_capacity(8);

        waker.wake();
        waker.wake();
        poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|r| r.token == WAKER_TOKEN));

        waker.drain();
        let n = poller.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(n, 0);
    }
}
