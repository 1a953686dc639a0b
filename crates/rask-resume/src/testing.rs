// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fakes for driving the runtime without real sockets.
//!
//! - `FakePoller`: records registrations, hands out queued readiness events
//! - `ScriptedTransport`: connect/read/write outcomes scripted step by step
//! - `ScriptedRequest` / `ScriptedResponse`: exchanges that never touch I/O
//!
//! All fakes are cheap clonable handles over shared state, so a test can
//! keep one clone for inspection after moving the other into the
//! multiplexer.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::connection::Transport;
use crate::cont::Erased;
use crate::error::StepError;
use crate::operation::{Progress, Request, Response};
use crate::reactor::{Interest, Poller, Readiness};

#[derive(Debug, Default)]
struct PollerState {
    registrations: HashMap<RawFd, Interest>,
    queued: VecDeque<(RawFd, Readiness)>,
    fail_next: Option<io::ErrorKind>,
    failing_deregisters: usize,
    always_ready: bool,
    polls: usize,
}

/// In-memory readiness primitive.
#[derive(Debug, Clone, Default)]
pub struct FakePoller {
    inner: Rc<RefCell<PollerState>>,
}

impl FakePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// A poller that reports every registered fd as ready for exactly the
    /// interest it was registered with, on every poll.
    pub fn always_ready() -> Self {
        let poller = Self::default();
        poller.inner.borrow_mut().always_ready = true;
        poller
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.inner.borrow().registrations.get(&fd).copied()
    }

    pub fn registered(&self) -> usize {
        self.inner.borrow().registrations.len()
    }

    pub fn polls(&self) -> usize {
        self.inner.borrow().polls
    }

    /// Queue an event for the next `poll`.
    pub fn push_event(&self, fd: RawFd, readiness: Readiness) {
        self.inner.borrow_mut().queued.push_back((fd, readiness));
    }

    /// Make the next register/reregister call fail.
    pub fn fail_next(&self, kind: io::ErrorKind) {
        self.inner.borrow_mut().fail_next = Some(kind);
    }

    /// Make the next `count` deregister calls fail, leaving the fd
    /// registered.
    pub fn fail_deregisters(&self, count: usize) {
        self.inner.borrow_mut().failing_deregisters = count;
    }

    fn check_failure(&self) -> io::Result<()> {
        match self.inner.borrow_mut().fail_next.take() {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }
}

impl Poller for FakePoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.check_failure()?;
        self.inner.borrow_mut().registrations.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.register(fd, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let mut state = self.inner.borrow_mut();
        if state.failing_deregisters > 0 {
            state.failing_deregisters -= 1;
            return Err(io::ErrorKind::PermissionDenied.into());
        }
        state.registrations.remove(&fd);
        Ok(())
    }

    fn poll(
        &mut self,
        _timeout: Option<Duration>,
        events: &mut Vec<(RawFd, Readiness)>,
    ) -> io::Result<()> {
        let mut state = self.inner.borrow_mut();
        state.polls += 1;
        events.extend(state.queued.drain(..));
        if state.always_ready {
            let mut ready: Vec<_> = state
                .registrations
                .iter()
                .map(|(&fd, &interest)| {
                    let readiness = Readiness {
                        readable: interest.is_readable(),
                        writable: interest.is_writable(),
                        ..Readiness::default()
                    };
                    (fd, readiness)
                })
                .collect();
            ready.sort_by_key(|(fd, _)| *fd);
            events.extend(ready);
        }
        Ok(())
    }
}

/// One scripted outcome of `Write::write`.
#[derive(Debug)]
pub enum WriteStep {
    /// Accept at most this many bytes.
    Accept(usize),
    WouldBlock,
    Fail(io::ErrorKind),
}

/// One scripted outcome of `Read::read`.
#[derive(Debug)]
pub enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Debug)]
struct Script {
    fd: RawFd,
    connects: VecDeque<io::Result<Progress>>,
    writes: VecDeque<WriteStep>,
    reads: VecDeque<ReadStep>,
    written: Vec<u8>,
    socket_error: Option<io::ErrorKind>,
    resets: usize,
}

/// Transport whose every outcome is scripted.
///
/// Unscripted connect steps succeed, unscripted writes accept everything,
/// unscripted reads would block.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    inner: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new(fd: RawFd) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Script {
                fd,
                connects: VecDeque::new(),
                writes: VecDeque::new(),
                reads: VecDeque::new(),
                written: Vec::new(),
                socket_error: None,
                resets: 0,
            })),
        }
    }

    pub fn push_connect(&self, step: io::Result<Progress>) {
        self.inner.borrow_mut().connects.push_back(step);
    }

    pub fn push_write(&self, step: WriteStep) {
        self.inner.borrow_mut().writes.push_back(step);
    }

    pub fn push_read(&self, step: ReadStep) {
        self.inner.borrow_mut().reads.push_back(step);
    }

    /// Error reported through `take_error` (once).
    pub fn set_socket_error(&self, kind: io::ErrorKind) {
        self.inner.borrow_mut().socket_error = Some(kind);
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().written.clone()
    }

    pub fn resets(&self) -> usize {
        self.inner.borrow().resets
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.inner.borrow_mut();
        match script.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.inner.borrow_mut();
        let n = match script.writes.pop_front() {
            None => buf.len(),
            Some(WriteStep::Accept(limit)) => buf.len().min(limit),
            Some(WriteStep::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(WriteStep::Fail(kind)) => return Err(kind.into()),
        };
        script.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    fn connect_step(&mut self) -> io::Result<Progress> {
        self.inner
            .borrow_mut()
            .connects
            .pop_front()
            .unwrap_or(Ok(Progress::Done))
    }

    fn take_error(&mut self) -> Option<io::Error> {
        self.inner.borrow_mut().socket_error.take().map(io::Error::from)
    }

    fn reset(&mut self) {
        self.inner.borrow_mut().resets += 1;
    }
}

/// Request that reports scripted step outcomes without writing anything.
/// Unscripted steps complete.
#[derive(Debug, Default)]
pub struct ScriptedRequest {
    steps: VecDeque<Result<Progress, StepError>>,
}

impl ScriptedRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Result<Progress, StepError>) -> Self {
        self.steps.push_back(step);
        self
    }
}

impl Request for ScriptedRequest {
    fn send_step(&mut self, _out: &mut dyn Write) -> Result<Progress, StepError> {
        self.steps.pop_front().unwrap_or(Ok(Progress::Done))
    }
}

/// Response that reports scripted step outcomes and then yields a fixed
/// payload. Unscripted steps complete.
#[derive(Debug)]
pub struct ScriptedResponse {
    steps: VecDeque<Result<Progress, StepError>>,
    payload: Option<Erased>,
}

impl ScriptedResponse {
    pub fn new<T: Any>(payload: T) -> Self {
        Self {
            steps: VecDeque::new(),
            payload: Some(Erased::new(payload)),
        }
    }

    pub fn step(mut self, step: Result<Progress, StepError>) -> Self {
        self.steps.push_back(step);
        self
    }
}

impl Response for ScriptedResponse {
    fn receive_step(&mut self, _input: &mut dyn Read) -> Result<Progress, StepError> {
        self.steps.pop_front().unwrap_or(Ok(Progress::Done))
    }

    fn take_payload(&mut self) -> Erased {
        self.payload.take().unwrap_or_else(|| Erased::new(()))
    }
}

/// Install a trace-level subscriber writing to the test harness.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}
