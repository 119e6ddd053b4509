//! Connection failures, teardown and bogus completions.

mod common;

use common::{exchange, pair, pattern, pump, pump_until, warm_up};
use ptl_ib::verbs::{CompletionStatus, QpState, WrOpcode};
use ptl_ib::{
    CompletionOrder, HostBuffer, PeerState, PtlConfig, PtlError, PtlEvent, SendFlags, SendStatus,
    WorkCompletion,
};

/// The active side's first queue pair on a fresh simulated device.
const FIRST_QP: u32 = 1;

#[test]
fn test_qp_fatal_fails_in_flight_requests() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    assert_eq!(net.qp_state(a.addr, FIRST_QP), Some(QpState::ReadyToSend));

    net.hold_completions(a.addr);
    let mut pending = Vec::new();
    for i in 0..3u8 {
        let (req, done) = a
            .ptl
            .request_init(HostBuffer::from_vec(pattern(1024, i)), 1024, i as u64)
            .unwrap();
        let status = a.ptl.send(b.name, req, 0, 1024, SendFlags::NONE).unwrap();
        assert_eq!(status, SendStatus::Issued);
        pending.push((req, done));
    }

    net.inject_qp_fatal(a.addr, FIRST_QP);
    a.ptl.progress();
    for (_, done) in pending.iter_mut() {
        match done.try_take() {
            Some(Err(PtlError::ConnectionLost { peer })) => assert_eq!(peer, b.name),
            other => panic!("expected connection loss, got {:?}", other),
        }
        assert!(done.try_take().is_none());
    }
    assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Failed));
    assert!(a.saw(&PtlEvent::PeerFailed { peer: b.name }));

    let (req, _done) = a
        .ptl
        .request_init(HostBuffer::zeroed(8), 8, 0)
        .unwrap();
    assert!(matches!(
        a.ptl.send(b.name, req, 0, 8, SendFlags::NONE),
        Err(PtlError::PeerFailed { .. })
    ));

    // the held completions name descriptors that were already reclaimed
    assert_eq!(net.release_completions(a.addr, CompletionOrder::Fifo), 3);
    a.ptl.progress();
    let m = a.ptl.metrics();
    assert_eq!(m.stale_completions, 3);
    assert_eq!(m.requests_failed, 3);
    assert_eq!(m.connected_peers, 0);
    for (req, _) in pending {
        a.ptl.request_return(req).unwrap();
    }
    assert_eq!(a.ptl.stats().send_frags.in_use, 0);
}

#[test]
fn test_del_procs_fails_outstanding_rendezvous() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    let len = 1 << 20;
    let src = HostBuffer::from_vec(pattern(len, 1));
    let (req, mut sent) = a.ptl.request_init(src.clone(), len, 0).unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::NONE).unwrap();
    pump(&mut a, &mut b, 5);
    assert_eq!(b.take_arrivals().len(), 1);

    a.ptl.del_procs(&[b.name]);
    assert!(matches!(
        sent.try_take(),
        Some(Err(PtlError::ConnectionLost { .. }))
    ));
    assert_eq!(a.ptl.peer_state(b.name), None);
    assert!(a.ptl.registration(src.addr(), len).is_none());

    // the receiver still holds the unmatched message, so the disconnect fails it
    pump(&mut a, &mut b, 3);
    assert_eq!(b.ptl.peer_state(a.name), Some(PeerState::Failed));
    assert!(b.saw(&PtlEvent::PeerFailed { peer: a.name }));
    // only the send counts as a failed request
    assert_eq!(a.ptl.metrics().requests_failed, 1);
    assert_eq!(b.ptl.metrics().requests_failed, 0);
}

#[test]
fn test_port_down_fails_connected_peers() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    net.set_port_active(a.addr, false);
    a.ptl.progress();
    assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Failed));
    assert_eq!(a.ptl.metrics().peers_failed, 1);
}

#[test]
fn test_bogus_completions_are_discarded() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    net.inject_completion(
        a.addr,
        WorkCompletion {
            wr_id: u64::MAX,
            status: CompletionStatus::Success,
            opcode: WrOpcode::Recv,
            byte_len: 100,
            qp_num: FIRST_QP,
        },
    );
    net.inject_completion(
        a.addr,
        WorkCompletion {
            wr_id: 0xffff_ffff_0000_0000,
            status: CompletionStatus::RemoteError,
            opcode: WrOpcode::Send,
            byte_len: 0,
            qp_num: FIRST_QP,
        },
    );
    a.ptl.progress();
    assert_eq!(a.ptl.metrics().stale_completions, 2);
    assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Connected));
    exchange(&mut a, &mut b, pattern(64, 3));
}

#[test]
fn test_unreachable_peer_fails_first_send() {
    let (net, mut a, b) = pair(PtlConfig::default());
    net.set_port_active(b.addr, false);
    let (req, mut done) = a
        .ptl
        .request_init(HostBuffer::zeroed(16), 16, 0)
        .unwrap();
    assert!(matches!(
        a.ptl.send(b.name, req, 0, 16, SendFlags::NONE),
        Err(PtlError::ConnectionLost { .. })
    ));
    assert!(matches!(
        done.try_take(),
        Some(Err(PtlError::ConnectionLost { .. }))
    ));
    assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Failed));
    assert!(a.saw(&PtlEvent::PeerFailed { peer: b.name }));
}

#[test]
fn test_request_fini_before_issue() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    let (req, _done) = a
        .ptl
        .request_init(HostBuffer::zeroed(32), 32, 0)
        .unwrap();
    // still connecting: nothing reached the wire
    assert_eq!(
        a.ptl.send(b.name, req, 0, 32, SendFlags::NONE).unwrap(),
        SendStatus::Queued
    );
    a.ptl.request_fini(req).unwrap();
    let peer = b.name;
    pump_until(&mut a, &mut b, |a, _| {
        (a.ptl.peer_state(peer) == Some(PeerState::Connected)).then_some(())
    });
    pump(&mut a, &mut b, 5);
    assert!(b.take_arrivals().is_empty());

    let (req, _done) = a
        .ptl
        .request_init(HostBuffer::zeroed(32), 32, 0)
        .unwrap();
    a.ptl.send(b.name, req, 0, 32, SendFlags::NONE).unwrap();
    assert!(matches!(
        a.ptl.request_fini(req),
        Err(PtlError::RequestInFlight(_))
    ));
}
