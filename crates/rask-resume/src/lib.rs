// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resumable task runtime.
//!
//! Lets short-lived units of work call request/response backends without
//! blocking the worker. There are no coroutines underneath: a task is an
//! explicit state machine, its awaited results travel in continuation
//! boxes, and one multiplexer per worker drives every connection from
//! readiness events.
//!
//! Components:
//! - cont: type-erased continuation box, converter registry
//! - task: suspend/resume contract, task context, handles
//! - connection: per-socket state machine (connect, send, receive)
//! - operation: request/response steps and stock framings
//! - mux: owner of connections and in-flight exchanges
//! - event_loop: single-threaded loop tying tasks to the multiplexer
//! - reactor/net: epoll readiness and socket transports
//! - testing: fakes for driving all of the above without sockets

pub mod config;
pub mod connection;
pub mod cont;
pub mod error;
pub mod event_loop;
pub mod id;
pub mod mux;
pub mod net;
pub mod operation;
pub mod reactor;
pub mod task;
pub mod testing;

pub use config::RuntimeConfig;
pub use connection::{ConnState, Connection, Transport};
pub use cont::{ContinuationBox, ConverterRegistry, Erased, Mixed, TypeTag};
pub use error::{ConfigError, LoopError, MuxError, RtError, StepError};
pub use event_loop::EventLoop;
pub use id::{ConnectionId, RequestId, TaskId};
pub use mux::Multiplexer;
pub use operation::{Progress, Request, Response};
pub use reactor::{Interest, Poller, Reactor, Readiness};
pub use task::{SuspendableTask, TaskContext, TaskHandle, TaskState};
