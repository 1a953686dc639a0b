// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! `RtError` is what a suspended task sees when it loads a failed result:
//! it crosses the suspension boundary as a deferred failure. `MuxError` is
//! returned straight to the caller that misused the multiplexer.

use std::io;

use thiserror::Error;

use crate::connection::ConnState;
use crate::id::{ConnectionId, RequestId, TaskId};

/// A failure delivered through a continuation box.
#[derive(Debug, Error)]
pub enum RtError {
    /// The non-blocking connect handshake failed.
    #[error("connect on {conn} failed: {source}")]
    ConnectFailed {
        conn: ConnectionId,
        #[source]
        source: io::Error,
    },

    /// The socket failed mid-operation.
    #[error("I/O error on {conn}: {source}")]
    Io {
        conn: ConnectionId,
        #[source]
        source: io::Error,
    },

    /// Peer closed the connection before the exchange finished.
    #[error("peer closed the connection before the response was complete")]
    Eof,

    /// Backend-specific failure. Does not take the connection down.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was removed or reset while the exchange was pending.
    #[error("{0} closed while an operation was in flight")]
    ConnectionClosed(ConnectionId),

    /// The task was torn down by its owner.
    #[error("task aborted: {0}")]
    Aborted(String),

    /// A deadline imposed from outside the runtime expired.
    #[error("deadline exceeded")]
    Timeout,

    /// The multiplexer refused to start the exchange.
    #[error("operation rejected: {0}")]
    Rejected(#[from] MuxError),
}

impl RtError {
    /// Build an `Io` error from a raw OS error on `conn`.
    pub fn io(conn: ConnectionId, source: io::Error) -> Self {
        RtError::Io { conn, source }
    }

    /// Whether this failure leaves the connection unusable.
    ///
    /// Protocol, abort and timeout failures belong to one exchange;
    /// everything else means the socket is gone.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            RtError::ConnectFailed { .. }
            | RtError::Io { .. }
            | RtError::Eof
            | RtError::ConnectionClosed(_) => true,
            RtError::Protocol(_)
            | RtError::Aborted(_)
            | RtError::Timeout
            | RtError::Rejected(_) => false,
        }
    }
}

/// Failure reported by one non-blocking request/response step.
///
/// Steps do not know which connection they run on; the connection turns
/// this into an [`RtError`] carrying its id.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Eof,

    /// The reply is bad but the stream is still in sync.
    #[error("{0}")]
    Protocol(String),

    /// The stream can no longer be trusted (framing lost, oversized frame).
    #[error("{0}")]
    Broken(String),
}

impl StepError {
    pub fn into_rt(self, conn: ConnectionId) -> RtError {
        match self {
            StepError::Io(source) => RtError::Io { conn, source },
            StepError::Eof => RtError::Eof,
            StepError::Protocol(msg) => RtError::Protocol(msg),
            StepError::Broken(msg) => RtError::Io {
                conn,
                source: io::Error::new(io::ErrorKind::InvalidData, msg),
            },
        }
    }
}

/// A rejected call into the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection already carries an exchange (or is not connected).
    #[error("{conn} is {state}, operations can only start on an idle connection")]
    ConnectionBusy { conn: ConnectionId, state: ConnState },

    #[error("unknown request {0} (never started or already withdrawn)")]
    UnknownRequest(RequestId),

    #[error("request {0} has not completed yet")]
    NotComplete(RequestId),

    /// The task already awaits another exchange.
    #[error("{task} already awaits {pending}")]
    TaskBusy { task: TaskId, pending: RequestId },

    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),

    #[error("readiness registration failed: {0}")]
    Poller(#[from] io::Error),
}

/// Failure of the event loop itself.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Tasks are alive but nothing can ever wake them.
    #[error("{live} task(s) suspended with no operation in flight")]
    Stalled { live: usize },

    #[error("readiness poll failed: {0}")]
    Poller(#[from] io::Error),
}

/// Bad configuration override.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse `{value}` as {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let conn = ConnectionId::new(1);
        assert!(RtError::Eof.is_connection_fatal());
        assert!(RtError::ConnectionClosed(conn).is_connection_fatal());
        let broken_pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(RtError::io(conn, broken_pipe).is_connection_fatal());
        assert!(!RtError::Protocol("bad row".into()).is_connection_fatal());
        assert!(!RtError::Timeout.is_connection_fatal());
    }

    #[test]
    fn step_errors_map_to_connection_errors() {
        let conn = ConnectionId::new(4);
        assert!(StepError::Broken("frame too large".into())
            .into_rt(conn)
            .is_connection_fatal());
        assert!(!StepError::Protocol("bad utf-8".into())
            .into_rt(conn)
            .is_connection_fatal());
        match StepError::Io(io::ErrorKind::ConnectionReset.into()).into_rt(conn) {
            RtError::Io { conn: c, source } => {
                assert_eq!(c, conn);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn busy_message_names_state() {
        let err = MuxError::ConnectionBusy {
            conn: ConnectionId::new(2),
            state: ConnState::ReadPending,
        };
        assert_eq!(
            err.to_string(),
            "conn#2 is read-pending, operations can only start on an idle connection"
        );
    }
}
