use super::{timeout_millis, Interest, Readiness, Waker, WAKER_TOKEN};
use nix::errno::Errno;
use nix::libc;
use nix::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::Duration;

pub(crate) struct Poller {
    kq: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let raw = kqueue()?;
        // SAFETY: `kqueue` returned a fresh descriptor that nothing else owns.
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { kq })
    }

    fn apply(&self, change: KEvent) -> Result<(), Errno> {
        kevent_ts(self.kq.as_raw_fd(), &[change], &mut [], None).map(drop)
    }

    /// Arm `fd` for one readiness report tagged with `token`.
    pub(crate) fn arm(&self, fd: BorrowedFd<'_>, token: u64, interest: Interest) -> io::Result<()> {
        let filter = match interest {
            Interest::Read => EventFilter::EVFILT_READ,
            Interest::Write => EventFilter::EVFILT_WRITE,
        };
        let change = KEvent::new(
            fd.as_raw_fd() as usize,
            filter,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_ONESHOT,
            FilterFlag::empty(),
            0,
            token as isize,
        );
        Ok(self.apply(change)?)
    }

    /// Forget `fd`. Filters that were never armed are ignored.
    pub(crate) fn deregister(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        for filter in [EventFilter::EVFILT_READ, EventFilter::EVFILT_WRITE] {
            let change = KEvent::new(
                fd.as_raw_fd() as usize,
                filter,
                EventFlag::EV_DELETE,
                FilterFlag::empty(),
                0,
                0,
            );
            match self.apply(change) {
                Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn register_waker(&self, waker: &Waker) -> io::Result<()> {
        let change = KEvent::new(
            waker.read_fd().as_raw_fd() as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            FilterFlag::empty(),
            0,
            WAKER_TOKEN as isize,
        );
        Ok(self.apply(change)?)
    }

    pub(crate) fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout_millis(timeout).map(|ms| libc::timespec {
            tv_sec: (ms / 1_000) as libc::time_t,
            tv_nsec: ((ms % 1_000) * 1_000_000) as libc::c_long,
        });
        match kevent_ts(self.kq.as_raw_fd(), &[], &mut events.raw, timeout) {
            Ok(n) => {
                events.len = n;
                Ok(n)
            }
            Err(Errno::EINTR) => {
                events.len = 0;
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub(crate) struct Events {
    raw: Vec<KEvent>,
    len: usize,
}

// SAFETY: `udata` only ever carries a token copied in by `arm`; it is never
// dereferenced.
unsafe impl Send for Events {}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let empty = KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
        Self {
            raw: vec![empty; capacity.max(1)],
            len: 0,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.raw[..self.len].iter().map(|event| {
            let filter = event.filter().ok();
            let flags = event.flags();
            Readiness {
                token: event.udata() as u64,
                readable: filter == Some(EventFilter::EVFILT_READ),
                writable: filter == Some(EventFilter::EVFILT_WRITE),
                hangup: flags.contains(EventFlag::EV_EOF),
                error: flags.contains(EventFlag::EV_ERROR),
            }
        })
    }
}
