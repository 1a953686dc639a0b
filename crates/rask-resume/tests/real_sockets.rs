// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks talking to real peers through the epoll reactor.

mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use common::*;
use rask_resume::net::{TcpTransport, UnixTransport};
use rask_resume::{ConnState, EventLoop, RuntimeConfig};

/// Answer every line with `re: <line>` until the peer hangs up.
fn echo_lines<S: std::io::Read + Write>(stream: S, lines: usize) -> S {
    let mut reader = BufReader::new(stream);
    for _ in 0..lines {
        let mut line = String::new();
        if reader.read_line(&mut line).expect("read line") == 0 {
            break;
        }
        let reply = format!("re: {}\n", line.trim_end());
        reader.get_mut().write_all(reply.as_bytes()).expect("write reply");
    }
    reader.into_inner()
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        poll_timeout: Some(Duration::from_millis(20)),
        ..RuntimeConfig::default()
    }
}

#[test]
fn socketpair_round_trips() {
    init_test_logging();
    let (ours, theirs) = UnixStream::pair().unwrap();
    let peer = thread::spawn(move || echo_lines(theirs, 2));

    let mut event_loop = EventLoop::new(config()).unwrap();
    let conn = event_loop
        .multiplexer_mut()
        .register_connection(Box::new(UnixTransport::from_stream(ours).unwrap()))
        .unwrap();

    let first = event_loop.spawn(LineCall::new(conn, "one"));
    event_loop.run().unwrap();
    assert_eq!(first.try_take().unwrap().unwrap(), "re: one");

    let second = event_loop.spawn(LineCall::new(conn, "two"));
    event_loop.run().unwrap();
    assert_eq!(second.try_take().unwrap().unwrap(), "re: two");

    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::Idle)
    );
    assert_eq!(event_loop.multiplexer().registered_len(), 0);
    drop(peer.join().unwrap());
}

#[test]
fn peer_hangup_fails_the_waiting_task() {
    init_test_logging();
    let (ours, theirs) = UnixStream::pair().unwrap();
    // Read the request, then close without answering.
    let peer = thread::spawn(move || {
        let mut reader = BufReader::new(theirs);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
    });

    let mut event_loop = EventLoop::new(config()).unwrap();
    let conn = event_loop
        .multiplexer_mut()
        .register_connection(Box::new(UnixTransport::from_stream(ours).unwrap()))
        .unwrap();

    let handle = event_loop.spawn(LineCall::new(conn, "hello?"));
    event_loop.run().unwrap();
    peer.join().unwrap();

    let err = handle.try_take().unwrap().unwrap_err();
    assert!(err.is_connection_fatal(), "{err}");
    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::Disconnected)
    );
}

#[test]
fn tcp_connect_and_exchange() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        echo_lines(stream, 3)
    });

    let mut event_loop = EventLoop::new(config()).unwrap();
    let conn = event_loop
        .multiplexer_mut()
        .register_connection(Box::new(TcpTransport::new(addr)))
        .unwrap();

    for word in ["alpha", "beta", "gamma"] {
        let handle = event_loop.spawn(LineCall::new(conn, word));
        event_loop.run().unwrap();
        assert_eq!(handle.try_take().unwrap().unwrap(), format!("re: {word}"));
    }
    drop(peer.join().unwrap());
}
