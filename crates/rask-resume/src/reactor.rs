// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness notification: epoll-backed reactor.
//!
//! One reactor per worker, polled from the event loop on the same thread
//! that runs tasks. Level-triggered, so a connection that did not finish
//! its step simply gets the same event again on the next poll.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::trace;

/// I/O interest for reactor registration. A connection waits on one
/// direction at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }

    pub fn is_readable(self) -> bool {
        self == Interest::Readable
    }

    pub fn is_writable(self) -> bool {
        self == Interest::Writable
    }
}

/// What the OS reported for one fd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        hangup: false,
    };

    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
        hangup: false,
    };

    pub const ERROR: Readiness = Readiness {
        readable: false,
        writable: false,
        error: true,
        hangup: false,
    };

    pub const HANGUP: Readiness = Readiness {
        readable: false,
        writable: false,
        error: false,
        hangup: true,
    };

    fn from_epoll_events(events: u32) -> Self {
        Self {
            readable: events & (libc::EPOLLIN as u32) != 0,
            writable: events & (libc::EPOLLOUT as u32) != 0,
            error: events & (libc::EPOLLERR as u32) != 0,
            hangup: events & (libc::EPOLLHUP as u32) != 0,
        }
    }
}

/// The readiness primitive the multiplexer registers sockets with.
///
/// `Reactor` is the production implementation; tests plug in
/// [`FakePoller`](crate::testing::FakePoller).
pub trait Poller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Remove `fd`. Removing an fd that is not registered is not an error.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (forever if `None`) and append ready fds to
    /// `events`.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<(RawFd, Readiness)>,
    ) -> io::Result<()>;
}

/// Epoll instance owned by one worker (Linux).
pub struct Reactor {
    epoll_fd: RawFd,
    /// FD → current interest.
    registrations: HashMap<RawFd, Interest>,
    max_events: usize,
}

impl Reactor {
    /// Create a reactor that drains at most `max_events` per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll_fd,
            registrations: HashMap::new(),
            max_events: max_events.max(1),
        })
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.contains_key(&fd)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for Reactor {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let op = if self.registrations.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, interest)?;
        self.registrations.insert(fd, interest);
        trace!(fd, ?interest, "fd registered");
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if !self.registrations.contains_key(&fd) {
            return self.register(fd, interest);
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)?;
        self.registrations.insert(fd, interest);
        trace!(fd, ?interest, "fd interest changed");
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registrations.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(
                    self.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected if FD was already closed.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
            trace!(fd, "fd deregistered");
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<(RawFd, Readiness)>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                raw.as_mut_ptr(),
                raw.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(()); // EINTR: retry next cycle.
            }
            return Err(err);
        }

        for ev in &raw[..n as usize] {
            let fd = ev.u64 as RawFd;
            events.push((fd, Readiness::from_epoll_events(ev.events)));
        }
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for &fd in self.registrations.keys() {
            unsafe {
                libc::epoll_ctl(
                    self.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                );
            }
        }
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
