// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded event loop.
//!
//! One loop per worker. It owns the multiplexer and the task table, and
//! alternates between two things, never concurrently:
//!
//! 1. resume every runnable task (freshly spawned or woken by a completed
//!    exchange) until it finishes or suspends;
//! 2. poll readiness and let the multiplexer drive connections, which
//!    queues wakes for the owners of completed exchanges.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::task::Poll;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{LoopError, RtError};
use crate::id::{IdAllocator, TaskId};
use crate::mux::Multiplexer;
use crate::reactor::Poller;
use crate::task::{DynTask, Spawned, SuspendableTask, TaskContext, TaskHandle, TaskState};

struct TaskEntry {
    state: TaskState,
    task: Box<dyn DynTask>,
    /// Failure injected from outside, surfaced at the task's next
    /// collect or save.
    pending_failure: Option<RtError>,
}

pub struct EventLoop {
    mux: Multiplexer,
    tasks: HashMap<TaskId, TaskEntry>,
    runnable: VecDeque<TaskId>,
    task_ids: IdAllocator,
    poll_timeout: Option<Duration>,
}

impl EventLoop {
    /// Event loop over a fresh epoll reactor.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let poll_timeout = config.poll_timeout;
        Ok(Self::with_multiplexer(
            Multiplexer::with_reactor(config)?,
            poll_timeout,
        ))
    }

    pub fn with_poller(poller: Box<dyn Poller>, config: RuntimeConfig) -> Self {
        let poll_timeout = config.poll_timeout;
        Self::with_multiplexer(Multiplexer::new(poller, config), poll_timeout)
    }

    fn with_multiplexer(mux: Multiplexer, poll_timeout: Option<Duration>) -> Self {
        Self {
            mux,
            tasks: HashMap::new(),
            runnable: VecDeque::new(),
            task_ids: IdAllocator::new(),
            poll_timeout,
        }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn multiplexer_mut(&mut self) -> &mut Multiplexer {
        &mut self.mux
    }

    /// Queue `task` for its first resume.
    pub fn spawn<S>(&mut self, task: S) -> TaskHandle<S::Output>
    where
        S: SuspendableTask + 'static,
    {
        let id = TaskId::new(self.task_ids.next_raw());
        let (spawned, handle) = Spawned::new(id, task);
        self.tasks.insert(
            id,
            TaskEntry {
                state: TaskState::Created,
                task: Box::new(spawned),
                pending_failure: None,
            },
        );
        self.runnable.push_back(id);
        debug!(task = %id, "task spawned");
        handle
    }

    /// Tear `task` down. Its handle reports `RtError::Aborted`; whatever it
    /// still owns in the multiplexer is dropped or orphaned. Returns false
    /// if the task already finished.
    pub fn abort(&mut self, task: TaskId, reason: impl Into<String>) -> bool {
        let Some(mut entry) = self.tasks.remove(&task) else {
            return false;
        };
        let reason = reason.into();
        debug!(%task, state = %entry.state, %reason, "task aborted");
        self.runnable.retain(|t| *t != task);
        self.mux.abandon_task(task);
        entry.task.abort(RtError::Aborted(reason));
        true
    }

    /// Record a deferred failure for `task`. It surfaces the next time
    /// the task collects or saves a result. The first failure wins.
    pub fn inject_failure(&mut self, task: TaskId, err: RtError) -> bool {
        let Some(entry) = self.tasks.get_mut(&task) else {
            return false;
        };
        if let Some(first) = &entry.pending_failure {
            debug!(%task, %first, dropped = %err, "failure already pending");
            return true;
        }
        debug!(%task, %err, "failure injected");
        entry.pending_failure = Some(err);
        true
    }

    /// `None` once the task finished or was aborted.
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(&task).map(|entry| entry.state)
    }

    /// Tasks spawned and not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resume every task that can make progress right now. Returns how
    /// many resumes ran.
    pub fn run_ready(&mut self) -> usize {
        let mut resumed = 0;
        loop {
            self.runnable.extend(self.mux.drain_ready());
            let Some(id) = self.runnable.pop_front() else {
                return resumed;
            };
            if self.resume(id) {
                resumed += 1;
            }
        }
    }

    fn resume(&mut self, id: TaskId) -> bool {
        let Some(entry) = self.tasks.get_mut(&id) else {
            trace!(task = %id, "wake for finished task ignored");
            return false;
        };
        trace!(task = %id, from = %entry.state, "resume");
        entry.state = TaskState::Running;

        let mut cx = TaskContext::new(id, &mut self.mux, &mut entry.pending_failure);
        match entry.task.resume(&mut cx) {
            Poll::Ready(()) => {
                entry.state = TaskState::Completed;
                self.tasks.remove(&id);
                self.mux.abandon_task(id);
                debug!(task = %id, "task completed");
            }
            Poll::Pending => {
                let Some(request) = self.mux.awaited_by(id) else {
                    panic!("{id} suspended without an exchange in flight; nothing can wake it");
                };
                entry.state = TaskState::Suspended;
                trace!(task = %id, %request, "suspended");
            }
        }
        true
    }

    /// One loop iteration: resume what is runnable, wait up to `timeout`
    /// for readiness, then resume what that woke.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, LoopError> {
        let mut resumed = self.run_ready();
        if self.tasks.is_empty() {
            return Ok(resumed);
        }
        self.mux.poll(timeout)?;
        resumed += self.run_ready();
        Ok(resumed)
    }

    /// Run until every task has finished.
    ///
    /// Fails with `LoopError::Stalled` when tasks remain but no descriptor
    /// is registered and nothing is queued, since no event could ever wake
    /// them.
    pub fn run(&mut self) -> Result<(), LoopError> {
        loop {
            self.run_ready();
            if self.tasks.is_empty() {
                return Ok(());
            }
            if self.mux.registered_len() == 0 && !self.mux.has_ready() {
                let live = self.tasks.len();
                warn!(live, "event loop stalled");
                return Err(LoopError::Stalled { live });
            }
            self.mux.poll(self.poll_timeout)?;
        }
    }
}
