use super::{timeout_millis, Interest, Readiness, Waker, WAKER_TOKEN};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

pub(crate) struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    /// Arm `fd` for one readiness report tagged with `token`.
    pub(crate) fn arm(&self, fd: BorrowedFd<'_>, token: u64, interest: Interest) -> io::Result<()> {
        let direction = match interest {
            Interest::Read => EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            Interest::Write => EpollFlags::EPOLLOUT,
        };
        let mut event = EpollEvent::new(direction | EpollFlags::EPOLLONESHOT, token);

        match self.epoll.modify(fd, &mut event) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Ok(self.epoll.add(fd, event)?),
            Err(err) => Err(err.into()),
        }
    }

    /// Forget `fd`. Descriptors that were never armed are ignored.
    pub(crate) fn deregister(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        match self.epoll.delete(fd) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn register_waker(&self, waker: &Waker) -> io::Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, WAKER_TOKEN);
        Ok(self.epoll.add(waker.read_fd(), event)?)
    }

    /// Block until readiness, a wake, or `timeout`. An interrupted wait
    /// reports zero events.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout_millis(timeout).map_or(-1, |ms| ms as isize);
        match self.epoll.wait(&mut events.raw, timeout) {
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
    raw: Vec<EpollEvent>,
    len: usize,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![EpollEvent::empty(); capacity.max(1)],
            len: 0,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.raw[..self.len].iter().map(|event| {
            let flags = event.events();
            Readiness {
                token: event.data(),
                readable: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
                error: flags.contains(EpollFlags::EPOLLERR),
            }
        })
    }
}
