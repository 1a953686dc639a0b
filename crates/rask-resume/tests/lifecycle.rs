// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end task lifecycles over scripted connections.

mod common;

use common::*;
use rask_resume::testing::ReadStep;
use rask_resume::{ConnState, Interest, MuxError, Progress, Readiness, RtError, TaskState};

#[test]
fn connect_send_receive() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 3);
    transport.push_connect(Ok(Progress::Pending));

    let handle = event_loop.spawn(LineCall::new(conn, "GET a"));
    event_loop.run_ready();
    assert_eq!(event_loop.task_state(handle.id()), Some(TaskState::Suspended));
    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::Connecting)
    );
    assert_eq!(poller.interest(3), Some(Interest::Writable));

    // Handshake completes; the task resumes and queues its request.
    poller.push_event(3, Readiness::WRITABLE);
    assert_eq!(event_loop.turn(None).unwrap(), 1);
    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::WritePending)
    );

    poller.push_event(3, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();
    assert_eq!(transport.written(), b"GET a\n");
    assert_eq!(poller.interest(3), Some(Interest::Readable));

    transport.push_read(ReadStep::Data(b"value-a\n".to_vec()));
    poller.push_event(3, Readiness::READABLE);
    event_loop.turn(None).unwrap();

    assert_eq!(handle.try_take().unwrap().unwrap(), "value-a");
    assert_eq!(event_loop.live_tasks(), 0);
    assert_eq!(poller.registered(), 0);
    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::Idle)
    );
}

#[test]
fn completions_arrive_out_of_submission_order() {
    let (mut event_loop, poller) = fake_loop();
    let (ta, a) = scripted_conn(&mut event_loop, 10);
    let (tb, b) = scripted_conn(&mut event_loop, 11);

    let first = event_loop.spawn(LineCall::new(a, "slow"));
    let second = event_loop.spawn(LineCall::new(b, "fast"));
    // Both connect immediately and send.
    event_loop.run_ready();
    poller.push_event(10, Readiness::WRITABLE);
    poller.push_event(11, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();

    tb.push_read(ReadStep::Data(b"B\n".to_vec()));
    poller.push_event(11, Readiness::READABLE);
    event_loop.turn(None).unwrap();
    assert!(second.is_complete());
    assert!(!first.is_complete());

    ta.push_read(ReadStep::Data(b"A\n".to_vec()));
    poller.push_event(10, Readiness::READABLE);
    event_loop.turn(None).unwrap();

    assert_eq!(first.try_take().unwrap().unwrap(), "A");
    assert_eq!(second.try_take().unwrap().unwrap(), "B");
}

#[test]
fn second_task_cannot_share_a_busy_connection() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 4);

    let owner = event_loop.spawn(LineCall::new(conn, "one"));
    event_loop.run_ready();
    poller.push_event(4, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();

    let intruder = event_loop.spawn(LineCall::new(conn, "two"));
    event_loop.run_ready();
    match intruder.try_take() {
        Some(Err(RtError::Rejected(MuxError::ConnectionBusy { state, .. }))) => {
            assert_eq!(state, ConnState::ReadPending)
        }
        other => panic!("expected busy rejection, got {other:?}"),
    }

    transport.push_read(ReadStep::Data(b"1\n".to_vec()));
    poller.push_event(4, Readiness::READABLE);
    event_loop.turn(None).unwrap();
    assert_eq!(owner.try_take().unwrap().unwrap(), "1");
    assert_eq!(transport.written(), b"one\n");
}

#[test]
fn removing_a_connection_wakes_its_owner() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 5);

    let handle = event_loop.spawn(LineCall::new(conn, "ping"));
    event_loop.run_ready();
    poller.push_event(5, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();

    event_loop.multiplexer_mut().remove_connection(conn).unwrap();
    event_loop.run_ready();

    assert!(matches!(
        handle.try_take(),
        Some(Err(RtError::ConnectionClosed(c))) if c == conn
    ));
    assert_eq!(transport.resets(), 1);
    assert_eq!(event_loop.multiplexer().connection_count(), 0);
    assert_eq!(poller.registered(), 0);
}

#[test]
fn broken_connection_fails_owner_then_reconnects() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 6);

    let broken = event_loop.spawn(LineCall::new(conn, "first"));
    event_loop.run_ready();
    poller.push_event(6, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();
    transport.push_read(ReadStep::Eof);
    poller.push_event(6, Readiness::READABLE);
    event_loop.turn(None).unwrap();

    assert!(matches!(broken.try_take(), Some(Err(RtError::Eof))));
    assert_eq!(
        event_loop.multiplexer().connection_state(conn),
        Some(ConnState::Disconnected)
    );
    assert_eq!(transport.resets(), 1);

    let retry = event_loop.spawn(LineCall::new(conn, "second"));
    event_loop.run_ready();
    poller.push_event(6, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();
    transport.push_read(ReadStep::Data(b"ok\n".to_vec()));
    poller.push_event(6, Readiness::READABLE);
    event_loop.turn(None).unwrap();

    assert_eq!(retry.try_take().unwrap().unwrap(), "ok");
    assert_eq!(transport.written(), b"first\nsecond\n");
}

#[test]
fn connect_refused_reaches_the_task() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 7);
    transport.push_connect(Ok(Progress::Pending));
    transport.set_socket_error(std::io::ErrorKind::ConnectionRefused);

    let handle = event_loop.spawn(LineCall::new(conn, "x"));
    event_loop.run_ready();
    poller.push_event(7, Readiness::ERROR);
    event_loop.turn(None).unwrap();

    match handle.try_take() {
        Some(Err(RtError::ConnectFailed { conn: c, source })) => {
            assert_eq!(c, conn);
            assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
        }
        other => panic!("expected connect failure, got {other:?}"),
    }
    assert_eq!(poller.registered(), 0);
}

#[test]
fn aborted_task_leaves_connection_usable() {
    let (mut event_loop, poller) = fake_loop();
    let (transport, conn) = scripted_conn(&mut event_loop, 8);

    let doomed = event_loop.spawn(LineCall::new(conn, "slow"));
    event_loop.run_ready();
    poller.push_event(8, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();
    assert!(event_loop.abort(doomed.id(), "deadline exceeded"));

    // The reply still arrives and is discarded.
    transport.push_read(ReadStep::Data(b"late\n".to_vec()));
    poller.push_event(8, Readiness::READABLE);
    event_loop.multiplexer_mut().poll(None).unwrap();
    assert_eq!(event_loop.multiplexer().in_flight_len(), 0);
    assert!(!event_loop.multiplexer().has_ready());

    let next = event_loop.spawn(LineCall::new(conn, "fresh"));
    event_loop.run_ready();
    poller.push_event(8, Readiness::WRITABLE);
    event_loop.turn(None).unwrap();
    transport.push_read(ReadStep::Data(b"fresh\n".to_vec()));
    poller.push_event(8, Readiness::READABLE);
    event_loop.turn(None).unwrap();

    assert!(matches!(doomed.try_take(), Some(Err(RtError::Aborted(_)))));
    assert_eq!(next.try_take().unwrap().unwrap(), "fresh");
}
