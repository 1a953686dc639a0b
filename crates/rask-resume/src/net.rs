// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket transports.
//!
//! `TcpTransport` performs the connect handshake without blocking: the
//! first step issues `connect()` on a fresh non-blocking socket, later
//! steps (one per write-readiness event) check `SO_ERROR` and re-issue
//! `connect()` until the kernel reports the socket connected.
//!
//! `UnixTransport` wraps a Unix stream socket, either an already connected
//! one (a socketpair end) or a path to connect to.

use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use tracing::trace;

use crate::connection::Transport;
use crate::operation::Progress;

/// Set a file descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending error on a socket (`SO_ERROR`), clearing it.
fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
}

/// Encode `addr` as a raw sockaddr for `connect()`.
fn raw_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from(*a.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport has no open socket")
}

/// TCP client socket with a resumable non-blocking connect.
#[derive(Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    socket: Option<OwnedFd>,
}

impl TcpTransport {
    /// Transport for `addr`. No socket exists until the first connect step.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, socket: None }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn open(&mut self) -> io::Result<RawFd> {
        let domain = if self.addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `fd` was just returned by socket() and is owned by nobody else.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        self.socket = Some(owned);
        trace!(fd, addr = %self.addr, "tcp socket opened");
        Ok(fd)
    }

    fn raw(&self) -> io::Result<RawFd> {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(not_connected)
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        // MSG_NOSIGNAL: a reset peer must surface as EPIPE, not SIGPIPE.
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn connect_step(&mut self) -> io::Result<Progress> {
        let fd = match self.socket.as_ref() {
            Some(socket) => {
                let fd = socket.as_raw_fd();
                if let Some(err) = socket_error(fd)? {
                    self.socket = None;
                    return Err(err);
                }
                fd
            }
            None => self.open()?,
        };

        let (storage, len) = raw_sockaddr(&self.addr);
        let ret = unsafe {
            libc::connect(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret == 0 {
            return Ok(Progress::Done);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EISCONN) => Ok(Progress::Done),
            Some(libc::EINPROGRESS | libc::EALREADY | libc::EINTR) => Ok(Progress::Pending),
            _ => {
                self.socket = None;
                Err(err)
            }
        }
    }

    fn take_error(&mut self) -> Option<io::Error> {
        let fd = self.socket.as_ref()?.as_raw_fd();
        match socket_error(fd) {
            Ok(err) => err,
            Err(err) => Some(err),
        }
    }

    fn reset(&mut self) {
        if let Some(socket) = self.socket.take() {
            trace!(fd = socket.as_raw_fd(), addr = %self.addr, "tcp socket closed");
        }
    }
}

/// Unix stream socket transport.
#[derive(Debug)]
pub struct UnixTransport {
    path: Option<PathBuf>,
    stream: Option<UnixStream>,
}

impl UnixTransport {
    /// Transport connecting to the socket at `path`. Connecting to a local
    /// listener completes in one step.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            stream: None,
        }
    }

    /// Wrap a connected stream (e.g. one end of `UnixStream::pair()`).
    /// Such a transport cannot reconnect after a reset.
    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        set_nonblocking(stream.as_raw_fd())?;
        Ok(Self {
            path: None,
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> io::Result<&mut UnixStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Read for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for UnixTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Transport for UnixTransport {
    fn fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn connect_step(&mut self) -> io::Result<Progress> {
        if self.stream.is_some() {
            return Ok(Progress::Done);
        }
        let Some(path) = self.path.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socketpair transport cannot reconnect",
            ));
        };
        let stream = UnixStream::connect(path)?;
        set_nonblocking(stream.as_raw_fd())?;
        self.stream = Some(stream);
        Ok(Progress::Done)
    }

    fn take_error(&mut self) -> Option<io::Error> {
        match self.stream.as_ref()?.take_error() {
            Ok(err) => err,
            Err(err) => Some(err),
        }
    }

    fn reset(&mut self) {
        self.stream = None;
    }
}
