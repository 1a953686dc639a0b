// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-socket connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Idle -> WritePending -> ReadPending -> Idle
//!                     |                      |              |
//!                     +-------> Error <------+--------------+
//!                                 |
//!                                 +-> Disconnected (after the owner is told)
//! ```
//!
//! At most one operation is attached at a time. The connection never
//! talks to the reactor; it reports the interest it needs and the
//! multiplexer keeps the registration in sync.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use tracing::trace;

use crate::cont::Erased;
use crate::error::{MuxError, RtError};
use crate::id::{ConnectionId, RequestId};
use crate::operation::{Operation, Progress};
use crate::reactor::Interest;

/// The socket side of a connection, supplied by a protocol backend.
pub trait Transport: Read + Write {
    /// Descriptor to register for readiness. Only meaningful once a
    /// connect attempt has started.
    fn fd(&self) -> RawFd;

    /// Advance the non-blocking connect handshake. Called again on every
    /// write-readiness event until it returns `Done` or an error.
    fn connect_step(&mut self) -> io::Result<Progress>;

    /// Pending socket error, if the OS recorded one (`SO_ERROR`).
    fn take_error(&mut self) -> Option<io::Error> {
        None
    }

    /// Close the socket so that a later `connect_step` starts over.
    fn reset(&mut self);
}

/// Borrowed transport seen as a plain byte stream by request/response steps.
struct Stream<'a>(&'a mut dyn Transport);

impl Read for Stream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for Stream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Connection life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Idle,
    WritePending,
    ReadPending,
    Error,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Idle => "idle",
            ConnState::WritePending => "write-pending",
            ConnState::ReadPending => "read-pending",
            ConnState::Error => "error",
        })
    }
}

/// What a drive step produced, for the multiplexer to act on.
#[derive(Debug)]
pub enum Drive {
    /// Still working, nothing to report.
    Pending,
    /// Handshake finished. `request` is the connect exchange waiting on it.
    Connected { request: Option<RequestId> },
    /// Request fully written, now waiting for the reply.
    Sent,
    /// Exchange finished; the connection is idle again.
    Completed {
        request: RequestId,
        outcome: Result<Erased, RtError>,
    },
    /// The connection broke. `request` is whatever was in flight on it.
    Failed {
        request: Option<RequestId>,
        error: RtError,
    },
}

/// One external socket and the exchange currently running on it.
pub struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    state: ConnState,
    pending: Option<Operation>,
    /// Connect exchange a task suspended on, if any.
    connect_request: Option<RequestId>,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            state: ConnState::Disconnected,
            pending: None,
            connect_request: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn fd(&self) -> RawFd {
        self.transport.fd()
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnState::Idle
    }

    /// The operation or connect exchange that currently owns this connection.
    pub fn in_flight(&self) -> Option<RequestId> {
        self.pending
            .as_ref()
            .map(Operation::id)
            .or(self.connect_request)
    }

    /// Readiness this connection is waiting for in its current state.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Connecting | ConnState::WritePending => Some(Interest::Writable),
            ConnState::ReadPending => Some(Interest::Readable),
            ConnState::Disconnected | ConnState::Idle | ConnState::Error => None,
        }
    }

    fn set_state(&mut self, next: ConnState) {
        if self.state != next {
            trace!(conn = %self.id, from = %self.state, to = %next, "connection state");
            self.state = next;
        }
    }

    /// Advance the connect handshake.
    ///
    /// Safe to call repeatedly: a connected connection reports `Done`
    /// without touching the socket.
    pub fn connect_async(&mut self) -> Result<Progress, RtError> {
        match self.state {
            ConnState::Idle | ConnState::WritePending | ConnState::ReadPending => {
                return Ok(Progress::Done)
            }
            ConnState::Error => {
                self.transport.reset();
                self.set_state(ConnState::Connecting);
            }
            ConnState::Disconnected => self.set_state(ConnState::Connecting),
            ConnState::Connecting => {}
        }

        match self.transport.connect_step() {
            Ok(Progress::Done) => {
                self.set_state(ConnState::Idle);
                Ok(Progress::Done)
            }
            Ok(Progress::Pending) => Ok(Progress::Pending),
            Err(source) => {
                self.set_state(ConnState::Error);
                Err(RtError::ConnectFailed {
                    conn: self.id,
                    source,
                })
            }
        }
    }

    /// Attach `request` as the waiter for the connect handshake and take
    /// the first step.
    pub(crate) fn start_connect(&mut self, request: RequestId) -> Result<Drive, MuxError> {
        match (self.state, self.connect_request) {
            (ConnState::Disconnected | ConnState::Connecting | ConnState::Error, None) => {
                self.connect_request = Some(request);
                Ok(self.step_connect())
            }
            (state, _) => Err(MuxError::ConnectionBusy {
                conn: self.id,
                state,
            }),
        }
    }

    fn step_connect(&mut self) -> Drive {
        match self.connect_async() {
            Ok(Progress::Pending) => Drive::Pending,
            Ok(Progress::Done) => Drive::Connected {
                request: self.connect_request.take(),
            },
            Err(error) => Drive::Failed {
                request: self.connect_request.take(),
                error,
            },
        }
    }

    /// Attach `op`. Only legal on an idle connection.
    pub fn push_operation(&mut self, op: Operation) -> Result<(), MuxError> {
        if self.state != ConnState::Idle {
            return Err(MuxError::ConnectionBusy {
                conn: self.id,
                state: self.state,
            });
        }
        trace!(conn = %self.id, request = %op.id(), "operation attached");
        self.pending = Some(op);
        self.set_state(ConnState::WritePending);
        Ok(())
    }

    /// Detach an operation that never reached the socket.
    pub(crate) fn detach_unsent(&mut self) -> Option<Operation> {
        if self.state != ConnState::WritePending {
            return None;
        }
        self.set_state(ConnState::Idle);
        self.pending.take()
    }

    /// Write-readiness: finish the handshake or push the request out.
    pub fn on_writable(&mut self) -> Drive {
        match self.state {
            ConnState::Connecting => self.step_connect(),
            ConnState::WritePending => {
                let Some(op) = self.pending.as_mut() else {
                    return Drive::Pending;
                };
                match op.send_step(&mut Stream(&mut *self.transport)) {
                    Ok(Progress::Pending) => Drive::Pending,
                    Ok(Progress::Done) => {
                        self.set_state(ConnState::ReadPending);
                        // A reply may need no bytes, or already be buffered.
                        match self.on_readable() {
                            Drive::Pending => Drive::Sent,
                            drive => drive,
                        }
                    }
                    Err(err) => {
                        let error = err.into_rt(self.id);
                        self.finish_with_error(error)
                    }
                }
            }
            // Level-triggered leftovers from a state we already left.
            _ => Drive::Pending,
        }
    }

    /// Read-readiness: pull the reply in.
    pub fn on_readable(&mut self) -> Drive {
        if self.state != ConnState::ReadPending {
            return Drive::Pending;
        }
        let Some(op) = self.pending.as_mut() else {
            return Drive::Pending;
        };
        match op.receive_step(&mut Stream(&mut *self.transport)) {
            Ok(Progress::Pending) => Drive::Pending,
            Ok(Progress::Done) => {
                let Some(op) = self.pending.take() else {
                    return Drive::Pending;
                };
                self.set_state(ConnState::Idle);
                Drive::Completed {
                    request: op.id(),
                    outcome: Ok(op.into_payload()),
                }
            }
            Err(err) => {
                let error = err.into_rt(self.id);
                self.finish_with_error(error)
            }
        }
    }

    /// A step failed. Operation-level failures leave the connection idle;
    /// anything else breaks it.
    fn finish_with_error(&mut self, error: RtError) -> Drive {
        let request = self.pending.take().map(|op| op.id());
        if error.is_connection_fatal() {
            self.set_state(ConnState::Error);
            return Drive::Failed { request, error };
        }
        self.set_state(ConnState::Idle);
        match request {
            Some(request) => Drive::Completed {
                request,
                outcome: Err(error),
            },
            None => Drive::Pending,
        }
    }

    /// Break the connection with `error` from outside (error/hangup
    /// readiness, removal). Returns `Drive::Pending` when there was
    /// nothing in progress to fail.
    pub fn fail(&mut self, error: RtError) -> Drive {
        match self.state {
            ConnState::Disconnected | ConnState::Idle | ConnState::Error => Drive::Pending,
            ConnState::Connecting => {
                self.set_state(ConnState::Error);
                Drive::Failed {
                    request: self.connect_request.take(),
                    error,
                }
            }
            ConnState::WritePending | ConnState::ReadPending => {
                let request = self.pending.take().map(|op| op.id());
                self.set_state(ConnState::Error);
                Drive::Failed { request, error }
            }
        }
    }

    /// Socket error recorded by the OS, or a generic reset.
    pub(crate) fn socket_error(&mut self, hangup: bool) -> RtError {
        if self.state == ConnState::Connecting {
            let source = self
                .transport
                .take_error()
                .unwrap_or_else(|| io::ErrorKind::ConnectionRefused.into());
            return RtError::ConnectFailed {
                conn: self.id,
                source,
            };
        }
        match self.transport.take_error() {
            Some(source) => RtError::io(self.id, source),
            None if hangup => RtError::Eof,
            None => RtError::io(self.id, io::ErrorKind::ConnectionReset.into()),
        }
    }

    /// Close the socket and return to `Disconnected`. Anything still
    /// attached is dropped; the caller fails its owner first.
    pub fn reset(&mut self) {
        self.transport.reset();
        self.pending = None;
        self.connect_request = None;
        self.set_state(ConnState::Disconnected);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("connect_request", &self.connect_request)
            .finish()
    }
}
