// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspendable tasks.
//!
//! A task is an explicit state machine. `resume()` re-enters it at its last
//! suspension point; the task switches on its own phase marker, reads the
//! awaited result out of a `ContinuationBox`, and either finishes or starts
//! the next exchange and suspends again.
//!
//! ```text
//! Created -> Running -> (Suspended <-> Running)* -> Completed
//! ```
//!
//! Each suspension point issues exactly one exchange through the
//! `TaskContext`, which records the task as its owner and arms the box the
//! result will land in.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

use tracing::{debug, trace};

use crate::connection::ConnState;
use crate::cont::ContinuationBox;
use crate::error::{MuxError, RtError};
use crate::id::{ConnectionId, RequestId, TaskId};
use crate::mux::Multiplexer;
use crate::operation::{Request, Response};

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, never resumed.
    Created = 0,
    /// Inside `resume()`.
    Running = 1,
    /// Waiting for the one exchange it owns.
    Suspended = 2,
    /// Returned a final result or was aborted.
    Completed = 3,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Completed => "completed",
        })
    }
}

/// A unit of resumable work.
///
/// `resume` returns `Poll::Pending` to suspend. A task may only suspend
/// right after starting an exchange through its context; suspending with
/// nothing in flight means nobody would ever wake it, and the event loop
/// treats it as a bug.
pub trait SuspendableTask {
    type Output: 'static;

    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<Self::Output, RtError>>;
}

/// What a task sees while it runs.
pub struct TaskContext<'a> {
    task: TaskId,
    mux: &'a mut Multiplexer,
    pending_failure: &'a mut Option<RtError>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        task: TaskId,
        mux: &'a mut Multiplexer,
        pending_failure: &'a mut Option<RtError>,
    ) -> Self {
        Self {
            task,
            mux,
            pending_failure,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn multiplexer(&mut self) -> &mut Multiplexer {
        &mut *self.mux
    }

    /// Buffer growth step configured for stock responses.
    pub fn read_chunk(&self) -> usize {
        self.mux.config().read_chunk
    }

    /// State of `conn`, if it is registered.
    pub fn connection_state(&self, conn: ConnectionId) -> Option<ConnState> {
        self.mux.connection_state(conn)
    }

    /// Start an exchange on `conn` whose result will land in `cont`.
    ///
    /// The caller returns `Poll::Pending` right after a successful start.
    /// Panics if `cont` still holds or awaits something.
    pub fn start_operation(
        &mut self,
        conn: ConnectionId,
        request: impl Request + 'static,
        response: impl Response + 'static,
        cont: &mut ContinuationBox,
    ) -> Result<RequestId, MuxError> {
        ensure_unarmed(cont);
        let request =
            self.mux
                .start_operation(conn, Box::new(request), Box::new(response), self.task)?;
        cont.arm(request);
        Ok(request)
    }

    /// Start connecting `conn`. The box receives `()` once it is idle.
    pub fn start_connect(
        &mut self,
        conn: ConnectionId,
        cont: &mut ContinuationBox,
    ) -> Result<RequestId, MuxError> {
        ensure_unarmed(cont);
        let request = self.mux.start_connect(conn, self.task)?;
        cont.arm(request);
        Ok(request)
    }

    /// Move the outcome `cont` waits on out of the multiplexer into `cont`.
    ///
    /// Returns false while the exchange is still running. A deferred
    /// failure recorded for this task takes precedence over the outcome.
    /// A box that already holds its result keeps it, unless a deferred
    /// failure is pending.
    pub fn collect(&mut self, cont: &mut ContinuationBox) -> bool {
        let Some(request) = cont.awaited() else {
            assert!(
                !cont.is_empty(),
                "{} collects into a continuation box that awaits nothing",
                self.task
            );
            if let Some(failure) = self.pending_failure.take() {
                debug!(task = %self.task, %failure, "deferred failure overrides saved result");
                cont.save_failure(failure);
            }
            return true;
        };
        if !self.mux.is_complete(request) {
            trace!(task = %self.task, %request, "resumed before result arrived");
            return false;
        }
        let outcome = match self.mux.withdraw_response(request) {
            Ok(outcome) => outcome,
            Err(err) => panic!("{} cannot withdraw {request}: {err}", self.task),
        };
        if let Some(failure) = self.pending_failure.take() {
            debug!(task = %self.task, %request, %failure, "deferred failure overrides result");
            cont.save_failure(failure);
        }
        match outcome {
            Ok(payload) => cont.save_erased(payload),
            Err(err) => cont.save_failure(err),
        }
        true
    }

    /// `collect` then `load`: the usual way to read an awaited result.
    pub fn take<T: Any>(&mut self, cont: &mut ContinuationBox) -> Poll<Result<T, RtError>> {
        if !self.collect(cont) {
            return Poll::Pending;
        }
        Poll::Ready(cont.load())
    }

    /// Save a value the task computed itself. If a failure is pending for
    /// this task, the failure is stored instead.
    pub fn save<T: Any>(&mut self, cont: &mut ContinuationBox, value: T) {
        match self.pending_failure.take() {
            Some(failure) => cont.save_failure(failure),
            None => cont.save(value),
        }
    }

    /// Record a deferred failure. The first one recorded wins; it surfaces
    /// at the next `collect`, `take` or `save`.
    pub fn fail(&mut self, err: RtError) {
        if let Some(first) = self.pending_failure.as_ref() {
            debug!(task = %self.task, %first, dropped = %err, "failure already pending");
            return;
        }
        *self.pending_failure = Some(err);
    }

    pub fn pending_failure(&self) -> Option<&RtError> {
        self.pending_failure.as_ref()
    }
}

fn ensure_unarmed(cont: &ContinuationBox) {
    assert!(
        cont.is_empty(),
        "cannot await on {cont:?}: load it before starting another exchange"
    );
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("pending_failure", &self.pending_failure)
            .finish()
    }
}

pub(crate) enum TaskResult<T> {
    Running,
    Done(Result<T, RtError>),
    Taken,
}

/// Where a spawned task leaves its result for the handle.
pub(crate) type ResultSlot<T> = Rc<RefCell<TaskResult<T>>>;

/// Handle to a spawned task's result.
pub struct TaskHandle<T> {
    id: TaskId,
    result: ResultSlot<T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task finished (or was aborted).
    pub fn is_complete(&self) -> bool {
        !matches!(*self.result.borrow(), TaskResult::Running)
    }

    /// Take the result once the task finished. Later calls return `None`.
    pub fn try_take(&self) -> Option<Result<T, RtError>> {
        let mut slot = self.result.borrow_mut();
        match std::mem::replace(&mut *slot, TaskResult::Taken) {
            TaskResult::Done(result) => Some(result),
            other => {
                *slot = other;
                None
            }
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Object-safe view of a spawned task, owned by the event loop.
pub(crate) trait DynTask {
    /// `Ready` once the result has been stored.
    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Poll<()>;

    /// Store `err` as the result of a task that will never run again.
    fn abort(&mut self, err: RtError);
}

pub(crate) struct Spawned<S: SuspendableTask> {
    task: S,
    result: ResultSlot<S::Output>,
}

impl<S: SuspendableTask> Spawned<S> {
    pub(crate) fn new(id: TaskId, task: S) -> (Self, TaskHandle<S::Output>) {
        let result = Rc::new(RefCell::new(TaskResult::Running));
        let handle = TaskHandle {
            id,
            result: Rc::clone(&result),
        };
        (Self { task, result }, handle)
    }

    fn finish(&mut self, result: Result<S::Output, RtError>) {
        let mut slot = self.result.borrow_mut();
        if matches!(*slot, TaskResult::Running) {
            *slot = TaskResult::Done(result);
        }
    }
}

impl<S: SuspendableTask> DynTask for Spawned<S> {
    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Poll<()> {
        match self.task.resume(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.finish(result);
                Poll::Ready(())
            }
        }
    }

    fn abort(&mut self, err: RtError) {
        self.finish(Err(err));
    }
}
