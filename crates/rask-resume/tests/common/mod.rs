// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::Once;
use std::task::{ready, Poll};

use rask_resume::operation::{BytesRequest, LineResponse};
use rask_resume::testing::{FakePoller, ScriptedTransport};
use rask_resume::{
    ConnectionId, ContinuationBox, EventLoop, RtError, RuntimeConfig, SuspendableTask,
    TaskContext,
};

static INIT_LOGGING: Once = Once::new();

/// Install a trace-level subscriber that writes through the test harness.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// Event loop over a `FakePoller`, plus a handle on the poller.
pub fn fake_loop() -> (EventLoop, FakePoller) {
    init_test_logging();
    let poller = FakePoller::new();
    let event_loop = EventLoop::with_poller(Box::new(poller.clone()), RuntimeConfig::default());
    (event_loop, poller)
}

/// Register a scripted transport on `fd` and return it with its id.
pub fn scripted_conn(event_loop: &mut EventLoop, fd: i32) -> (ScriptedTransport, ConnectionId) {
    let transport = ScriptedTransport::new(fd);
    let conn = event_loop
        .multiplexer_mut()
        .register_connection(Box::new(transport.clone()))
        .expect("register connection");
    (transport, conn)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Send,
    Await,
}

/// Connects (if needed), sends one line, returns the reply line.
pub struct LineCall {
    conn: ConnectionId,
    line: String,
    step: Step,
    connected: ContinuationBox,
    reply: ContinuationBox,
}

impl LineCall {
    pub fn new(conn: ConnectionId, line: &str) -> Self {
        Self {
            conn,
            line: format!("{line}\n"),
            step: Step::Connect,
            connected: ContinuationBox::new(),
            reply: ContinuationBox::new(),
        }
    }
}

impl SuspendableTask for LineCall {
    type Output = String;

    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<String, RtError>> {
        match self.step {
            Step::Connect => {
                cx.start_connect(self.conn, &mut self.connected)?;
                self.step = Step::Send;
                Poll::Pending
            }
            Step::Send => {
                ready!(cx.take::<()>(&mut self.connected))?;
                cx.start_operation(
                    self.conn,
                    BytesRequest::new(self.line.clone()),
                    LineResponse::with_chunk(cx.read_chunk()),
                    &mut self.reply,
                )?;
                self.step = Step::Await;
                Poll::Pending
            }
            Step::Await => cx.take::<String>(&mut self.reply),
        }
    }
}
