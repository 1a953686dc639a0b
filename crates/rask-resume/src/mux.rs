// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The multiplexer: owner of every connection and every in-flight
//! exchange on one worker.
//!
//! It is the only target of readiness events. When an exchange finishes
//! it parks the outcome under the request id and queues exactly one wake
//! for the task that owns it. The owning task later withdraws the outcome
//! exactly once.
//!
//! A task torn down while it still owns an exchange leaves an orphan: the
//! exchange keeps running on its connection (dispatched operations are not
//! cancelled), and its outcome is discarded when it arrives.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::connection::{ConnState, Connection, Drive, Transport};
use crate::cont::Erased;
use crate::error::{MuxError, RtError};
use crate::id::{ConnectionId, IdAllocator, RequestId, TaskId};
use crate::operation::{Operation, Progress, Request, Response};
use crate::reactor::{Interest, Poller, Readiness, Reactor};

/// Result of one exchange as handed to its owner.
pub type Outcome = Result<Erased, RtError>;

struct Slot {
    conn: Connection,
    /// What the poller currently has for this connection.
    registered: Option<(RawFd, Interest)>,
}

struct InFlight {
    /// `None` once the owning task is gone.
    owner: Option<TaskId>,
    conn: ConnectionId,
    outcome: Option<Outcome>,
}

pub struct Multiplexer {
    poller: Box<dyn Poller>,
    connections: HashMap<ConnectionId, Slot>,
    by_fd: HashMap<RawFd, ConnectionId>,
    in_flight: HashMap<RequestId, InFlight>,
    /// Task → the one request it is waiting on.
    awaiting: HashMap<TaskId, RequestId>,
    ready: VecDeque<TaskId>,
    events: Vec<(RawFd, Readiness)>,
    conn_ids: IdAllocator,
    request_ids: IdAllocator,
    config: RuntimeConfig,
}

impl Multiplexer {
    pub fn new(poller: Box<dyn Poller>, config: RuntimeConfig) -> Self {
        Self {
            poller,
            connections: HashMap::new(),
            by_fd: HashMap::new(),
            in_flight: HashMap::new(),
            awaiting: HashMap::new(),
            ready: VecDeque::new(),
            events: Vec::with_capacity(config.max_events),
            conn_ids: IdAllocator::new(),
            request_ids: IdAllocator::new(),
            config,
        }
    }

    /// Multiplexer backed by a fresh epoll reactor.
    pub fn with_reactor(config: RuntimeConfig) -> io::Result<Self> {
        let reactor = Reactor::new(config.max_events)?;
        Ok(Self::new(Box::new(reactor), config))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ----------------------------------------------------------------------
    // Connections
    // ----------------------------------------------------------------------

    /// Take ownership of `transport` as a new, disconnected connection.
    pub fn register_connection(
        &mut self,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectionId, MuxError> {
        if self.connections.len() >= self.config.max_connections {
            error!(limit = self.config.max_connections, "connection limit reached");
            return Err(MuxError::TooManyConnections(self.config.max_connections));
        }
        let id = ConnectionId::new(self.conn_ids.next_raw());
        self.connections.insert(
            id,
            Slot {
                conn: Connection::new(id, transport),
                registered: None,
            },
        );
        debug!(conn = %id, "connection registered");
        Ok(id)
    }

    /// Close and forget a connection. An exchange still running on it
    /// completes with `ConnectionClosed`, waking its owner.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<(), MuxError> {
        let Some(mut slot) = self.connections.remove(&id) else {
            return Err(MuxError::UnknownConnection(id));
        };
        if let Some((fd, _)) = slot.registered.take() {
            self.by_fd.remove(&fd);
            if let Err(err) = self.poller.deregister(fd) {
                warn!(conn = %id, fd, %err, "deregister on removal failed");
            }
        }
        if let Some(request) = slot.conn.in_flight() {
            debug!(conn = %id, %request, "failing in-flight exchange on removal");
            self.complete(request, Err(RtError::ConnectionClosed(id)));
        }
        slot.conn.reset();
        debug!(conn = %id, "connection removed");
        Ok(())
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnState> {
        self.connections.get(&id).map(|slot| slot.conn.state())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors currently registered with the poller. Zero means no
    /// readiness event can ever arrive.
    pub fn registered_len(&self) -> usize {
        self.by_fd.len()
    }

    /// Drive the connect handshake outside any task. Call again (or let
    /// write-readiness drive it) until it reports `Done`.
    pub fn connect(&mut self, id: ConnectionId) -> Result<Progress, RtError> {
        let slot = self
            .connections
            .get_mut(&id)
            .ok_or(MuxError::UnknownConnection(id))?;
        if slot.conn.state() == ConnState::Connecting && slot.conn.in_flight().is_some() {
            // A task owns this handshake; readiness drives it.
            let err = MuxError::ConnectionBusy {
                conn: id,
                state: ConnState::Connecting,
            };
            error!(conn = %id, %err, "connect rejected");
            return Err(err.into());
        }
        let result = slot.conn.connect_async();
        if result.is_err() {
            slot.conn.reset();
        }
        self.sync_interest(id)?;
        result
    }

    /// Start a connect exchange `owner` can suspend on. Completes with a
    /// `()` payload once the connection is idle.
    pub fn start_connect(
        &mut self,
        id: ConnectionId,
        owner: TaskId,
    ) -> Result<RequestId, MuxError> {
        self.check_owner(owner)?;
        let request = RequestId::new(self.request_ids.next_raw());
        let slot = self
            .connections
            .get_mut(&id)
            .ok_or(MuxError::UnknownConnection(id))?;

        let drive = if slot.conn.is_idle() {
            Drive::Connected {
                request: Some(request),
            }
        } else {
            match slot.conn.start_connect(request) {
                Ok(drive) => drive,
                Err(err) => {
                    error!(conn = %id, %err, "connect rejected");
                    return Err(err);
                }
            }
        };
        self.track(request, owner, id);
        debug!(conn = %id, %request, task = %owner, "connect started");
        self.apply(id, drive);
        if let Err(err) = self.sync_interest(id) {
            self.fail_connection(id, err);
        }
        Ok(request)
    }

    // ----------------------------------------------------------------------
    // Operations
    // ----------------------------------------------------------------------

    /// Start an exchange on an idle connection on behalf of `owner`.
    ///
    /// Fails fast if the connection is unknown or busy, or if `owner`
    /// already waits on something.
    pub fn start_operation(
        &mut self,
        id: ConnectionId,
        request: Box<dyn Request>,
        response: Box<dyn Response>,
        owner: TaskId,
    ) -> Result<RequestId, MuxError> {
        self.check_owner(owner)?;
        let slot = self
            .connections
            .get_mut(&id)
            .ok_or(MuxError::UnknownConnection(id))?;
        if !slot.conn.is_idle() {
            let err = MuxError::ConnectionBusy {
                conn: id,
                state: slot.conn.state(),
            };
            error!(conn = %id, task = %owner, %err, "operation rejected");
            return Err(err);
        }

        let request_id = RequestId::new(self.request_ids.next_raw());
        slot.conn
            .push_operation(Operation::new(request_id, request, response))?;

        if let Err(err) = self.sync_interest(id) {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.conn.detach_unsent();
            }
            return Err(err);
        }
        self.track(request_id, owner, id);
        debug!(conn = %id, request = %request_id, task = %owner, "operation started");
        Ok(request_id)
    }

    fn check_owner(&self, owner: TaskId) -> Result<(), MuxError> {
        match self.awaiting.get(&owner) {
            Some(&pending) => {
                let err = MuxError::TaskBusy {
                    task: owner,
                    pending,
                };
                error!(%err, "task tried to await twice");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn track(&mut self, request: RequestId, owner: TaskId, conn: ConnectionId) {
        self.in_flight.insert(
            request,
            InFlight {
                owner: Some(owner),
                conn,
                outcome: None,
            },
        );
        self.awaiting.insert(owner, request);
    }

    /// Hand the outcome of `request` to its owner. Removes the entry, so a
    /// second call for the same id is rejected.
    pub fn withdraw_response(&mut self, request: RequestId) -> Result<Outcome, MuxError> {
        let Some(entry) = self.in_flight.get_mut(&request) else {
            error!(%request, "withdraw of unknown request");
            return Err(MuxError::UnknownRequest(request));
        };
        let Some(outcome) = entry.outcome.take() else {
            error!(%request, "withdraw before completion");
            return Err(MuxError::NotComplete(request));
        };
        if let Some(owner) = entry.owner {
            self.awaiting.remove(&owner);
        }
        self.in_flight.remove(&request);
        trace!(%request, "response withdrawn");
        Ok(outcome)
    }

    /// Whether `request` finished and waits to be withdrawn.
    pub fn is_complete(&self, request: RequestId) -> bool {
        self.in_flight
            .get(&request)
            .is_some_and(|entry| entry.outcome.is_some())
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Request `task` is waiting on, if any.
    pub fn awaited_by(&self, task: TaskId) -> Option<RequestId> {
        self.awaiting.get(&task).copied()
    }

    /// Number of tasks waiting on an exchange.
    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    /// Forget `task`: completed outcomes it never withdrew are dropped,
    /// pending ones become orphans discarded on completion.
    pub fn abandon_task(&mut self, task: TaskId) {
        self.ready.retain(|t| *t != task);
        let Some(request) = self.awaiting.remove(&task) else {
            return;
        };
        let Some(entry) = self.in_flight.get_mut(&request) else {
            return;
        };
        if entry.outcome.is_some() {
            self.in_flight.remove(&request);
            debug!(%task, %request, "discarded unclaimed response of finished task");
        } else {
            entry.owner = None;
            debug!(%task, %request, conn = %entry.conn, "exchange orphaned");
        }
    }

    /// Park `outcome` for the owner of `request` and queue its wake.
    fn complete(&mut self, request: RequestId, outcome: Outcome) {
        let Some(entry) = self.in_flight.get_mut(&request) else {
            warn!(%request, "completion for untracked request");
            return;
        };
        if entry.outcome.is_some() {
            error!(%request, "duplicate completion ignored");
            return;
        }
        let owner = entry.owner;
        match owner {
            None => {
                match &outcome {
                    Ok(payload) => {
                        let ty = payload.tag().name();
                        debug!(%request, ty, "orphaned completion discarded");
                    }
                    Err(err) => debug!(%request, %err, "orphaned failure discarded"),
                }
                self.in_flight.remove(&request);
            }
            Some(task) => {
                if let Err(err) = &outcome {
                    debug!(%request, %task, %err, "exchange failed");
                } else {
                    debug!(%request, %task, "exchange completed");
                }
                entry.outcome = Some(outcome);
                self.ready.push_back(task);
            }
        }
    }

    // ----------------------------------------------------------------------
    // Wakeups
    // ----------------------------------------------------------------------

    /// Tasks whose exchange completed since the last drain, in completion
    /// order.
    pub fn drain_ready(&mut self) -> Vec<TaskId> {
        self.ready.drain(..).collect()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    // ----------------------------------------------------------------------
    // Readiness
    // ----------------------------------------------------------------------

    /// Wait for readiness and dispatch every event. Returns the number of
    /// events handled.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let result = self.poller.poll(timeout, &mut events);
        let handled = events.len();
        for &(fd, readiness) in &events {
            self.on_fd_event(fd, readiness);
        }
        self.events = events;
        result.map(|()| handled)
    }

    /// Route one readiness event to the connection that owns `fd`.
    pub fn on_fd_event(&mut self, fd: RawFd, readiness: Readiness) {
        let Some(&id) = self.by_fd.get(&fd) else {
            debug!(fd, ?readiness, "event for unknown fd ignored");
            return;
        };
        let Some(slot) = self.connections.get_mut(&id) else {
            self.by_fd.remove(&fd);
            return;
        };
        trace!(conn = %id, fd, ?readiness, "readiness");

        let mut drives = Vec::with_capacity(2);
        if readiness.writable {
            drives.push(slot.conn.on_writable());
        }
        if readiness.readable {
            drives.push(slot.conn.on_readable());
        }
        if readiness.error || readiness.hangup {
            let error = slot.conn.socket_error(readiness.hangup);
            drives.push(slot.conn.fail(error));
        }

        for drive in drives {
            self.apply(id, drive);
        }
        if let Err(err) = self.sync_interest(id) {
            self.fail_connection(id, err);
        }
    }

    fn apply(&mut self, id: ConnectionId, drive: Drive) {
        match drive {
            Drive::Pending => {}
            Drive::Sent => trace!(conn = %id, "request sent"),
            Drive::Connected { request } => {
                debug!(conn = %id, "connected");
                if let Some(request) = request {
                    self.complete(request, Ok(Erased::new(())));
                }
            }
            Drive::Completed { request, outcome } => self.complete(request, outcome),
            Drive::Failed { request, error } => {
                warn!(conn = %id, %error, "connection failed");
                if let Some(slot) = self.connections.get_mut(&id) {
                    slot.conn.reset();
                }
                match request {
                    Some(request) => self.complete(request, Err(error)),
                    None => debug!(conn = %id, "no exchange in flight on failed connection"),
                }
            }
        }
    }

    /// Registration failed: nothing will ever drive this connection, so
    /// fail whatever runs on it.
    fn fail_connection(&mut self, id: ConnectionId, err: MuxError) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        let source = match err {
            MuxError::Poller(source) => source,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        };
        let drive = slot.conn.fail(RtError::io(id, source));
        self.apply(id, drive);
        if let Err(err) = self.sync_interest(id) {
            error!(conn = %id, %err, "cannot clear registration of failed connection");
        }
    }

    /// Bring the poller registration in line with what the connection
    /// currently waits for.
    fn sync_interest(&mut self, id: ConnectionId) -> Result<(), MuxError> {
        let Some(slot) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let wanted = slot.conn.interest().map(|interest| (slot.conn.fd(), interest));
        if wanted == slot.registered {
            return Ok(());
        }

        match (slot.registered, wanted) {
            (Some((old_fd, _)), Some((fd, interest))) if old_fd == fd => {
                self.poller.reregister(fd, interest)?;
            }
            (old, new) => {
                if let Some((old_fd, _)) = old {
                    self.poller.deregister(old_fd)?;
                    self.by_fd.remove(&old_fd);
                }
                if let Some((fd, interest)) = new {
                    slot.registered = None;
                    self.poller.register(fd, interest)?;
                    self.by_fd.insert(fd, id);
                }
            }
        }
        slot.registered = wanted;
        Ok(())
    }
}
