//! End-to-end transfers between two simulated processes.

mod common;

use common::{pair, pattern, pump_until, warm_up};
use ptl_ib::{HostBuffer, Protocol, PtlConfig, PtlError, PtlEvent, SendFlags, SendStatus};

#[test]
fn test_eager_message() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    let payload = pattern(1000, 9);
    let (req, mut sent) = a
        .ptl
        .request_init(HostBuffer::from_vec(payload.clone()), 1000, 0xabc)
        .unwrap();
    let status = a
        .ptl
        .send(b.name, req, 0, 1000, SendFlags::from_bits(0x05))
        .unwrap();
    assert_eq!(status, SendStatus::Queued);

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    assert_eq!(landing.match_bits, 0xabc);
    assert_eq!(landing.flags, 0x05);
    let outcome = pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    assert_eq!(outcome.protocol, Protocol::Eager);
    assert_eq!(outcome.fragments, 1);
    let received = pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(received.bytes, 1000);
    assert_eq!(received.peer, a.name);
    assert_eq!(landing.dest.to_vec(), payload);
    a.ptl.request_return(req).unwrap();
    assert_eq!(a.ptl.stats().requests.in_use, 0);
}

#[test]
fn test_send_of_sub_range() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    let payload = pattern(4096, 4);
    let (req, mut sent) = a
        .ptl
        .request_init(HostBuffer::from_vec(payload.clone()), 4096, 0)
        .unwrap();
    a.ptl.send(b.name, req, 1000, 500, SendFlags::NONE).unwrap();
    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(landing.dest.to_vec(), payload[1000..1500].to_vec());
}

#[test]
fn test_one_megabyte_rendezvous() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    let len = 1 << 20;
    let payload = pattern(len, 3);
    let src = HostBuffer::from_vec(payload.clone());
    let (req, mut sent) = a.ptl.request_init(src.clone(), len, 0x77).unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::NONE).unwrap();
    assert!(a.ptl.registration(src.addr(), len).is_some());

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    assert_eq!(landing.match_bits, 0x77);

    // the source stays pinned until the receiver acknowledged the FIN
    let mut outcome = None;
    for _ in 0..common::MAX_CYCLES {
        a.ptl.progress();
        b.ptl.progress();
        match sent.try_take() {
            Some(result) => {
                outcome = Some(result.unwrap());
                break;
            }
            None => assert!(a.ptl.registration(src.addr(), len).is_some()),
        }
    }
    let outcome = outcome.expect("rendezvous never completed");
    assert_eq!(outcome.protocol, Protocol::Rendezvous);
    assert_eq!(outcome.bytes, len);
    // start, eight writes, fin
    assert_eq!(outcome.fragments, 10);

    let received = landing.done.try_take().unwrap().unwrap();
    assert_eq!(received.bytes, len);
    assert_eq!(landing.dest.to_vec(), payload);

    let m = a.ptl.metrics();
    assert_eq!(m.rndv_sends, 1);
    assert_eq!(m.puts_issued, 8);
    assert_eq!(m.fins_sent, 1);
    assert!(a.ptl.registration(src.addr(), len).is_none());
    assert!(b.ptl.registration(landing.dest.addr(), len).is_none());
    a.ptl.request_return(req).unwrap();
}

#[test]
fn test_deferred_puts_driven_by_caller() {
    let (_net, mut a, mut b) = pair(PtlConfig::default());
    let len = 1 << 20;
    let payload = pattern(len, 5);
    let (req, mut sent) = a
        .ptl
        .request_init(HostBuffer::from_vec(payload.clone()), len, 1)
        .unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::DEFER_PUT).unwrap();
    assert!(matches!(
        a.ptl.put(b.name, req, 0, len, SendFlags::NONE),
        Err(PtlError::InvalidState(_))
    ));

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    let acked = PtlEvent::Acked {
        request: req,
        peer: b.name,
    };
    pump_until(&mut a, &mut b, |a, _| a.saw(&acked).then_some(()));
    assert_eq!(a.ptl.metrics().puts_issued, 0);

    let quarter = len / 4;
    assert!(a.ptl.put(b.name, req, quarter, quarter, SendFlags::NONE).is_err());
    for i in 0..4 {
        a.ptl
            .put(b.name, req, i * quarter, quarter, SendFlags::NONE)
            .unwrap();
    }
    assert!(a.ptl.put(b.name, req, len, 1, SendFlags::NONE).is_err());

    let outcome = pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    assert_eq!(outcome.protocol, Protocol::Rendezvous);
    assert_eq!(a.ptl.metrics().puts_issued, 8);
    pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(landing.dest.to_vec(), payload);
}

#[test]
fn test_sender_registration_failure_copies() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    let pinned = a.ptl.stats().registries[0].pinned_bytes;
    net.set_registration_limit(a.addr, Some(pinned));

    let len = 200_000;
    let payload = pattern(len, 6);
    let (req, mut sent) = a
        .ptl
        .request_init(HostBuffer::from_vec(payload.clone()), len, 2)
        .unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::NONE).unwrap();

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    let outcome = pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    assert_eq!(outcome.protocol, Protocol::CopyFallback);
    assert_eq!(outcome.fragments, 4);
    let received = pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(received.bytes, len);
    assert_eq!(landing.dest.to_vec(), payload);

    let m = a.ptl.metrics();
    assert_eq!(m.copy_fallbacks, 1);
    assert_eq!(m.puts_issued, 0);
}

#[test]
fn test_receiver_registration_failure_copies() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    let pinned = b.ptl.stats().registries[0].pinned_bytes;
    net.set_registration_limit(b.addr, Some(pinned));

    let len = 300_000;
    let payload = pattern(len, 8);
    let src = HostBuffer::from_vec(payload.clone());
    let (req, mut sent) = a.ptl.request_init(src.clone(), len, 3).unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::NONE).unwrap();

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    let outcome = pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    assert_eq!(outcome.protocol, Protocol::CopyFallback);
    // rendezvous start, then five copies
    assert_eq!(outcome.fragments, 6);
    let received = pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(received.bytes, len);
    assert_eq!(landing.dest.to_vec(), payload);

    assert!(a.ptl.registration(src.addr(), len).is_none());
    assert_eq!(a.ptl.metrics().rndv_sends, 1);
    assert_eq!(a.ptl.metrics().puts_issued, 0);
    assert_eq!(b.ptl.metrics().copy_fallbacks, 1);
}

#[test]
fn test_descriptor_exhaustion_parks_puts() {
    let config = PtlConfig {
        free_list_num: 2,
        free_list_max: 2,
        free_list_inc: 0,
        recv_prepost: 2,
        ..Default::default()
    };
    let (_net, mut a, mut b) = pair(config);
    let len = 1 << 20;
    let payload = pattern(len, 10);
    let (req, mut sent) = a
        .ptl
        .request_init(HostBuffer::from_vec(payload.clone()), len, 4)
        .unwrap();
    a.ptl.send(b.name, req, 0, len, SendFlags::NONE).unwrap();

    let mut landing = pump_until(&mut a, &mut b, |_, b| b.accept_all().pop());
    let outcome = pump_until(&mut a, &mut b, |_, _| sent.try_take()).unwrap();
    assert_eq!(outcome.protocol, Protocol::Rendezvous);
    pump_until(&mut a, &mut b, |_, _| landing.done.try_take()).unwrap();
    assert_eq!(landing.dest.to_vec(), payload);

    let m = a.ptl.metrics();
    assert_eq!(m.puts_issued, 8);
    assert!(m.backpressure_events > 0);
    assert!(a.ptl.stats().send_frags.exhausted > 0);
    assert_eq!(a.ptl.stats().send_frags.in_use, 0);
}

#[test]
fn test_finalize_unpins_everything() {
    let (net, mut a, mut b) = pair(PtlConfig::default());
    warm_up(&mut a, &mut b);
    assert!(net.registered_regions(a.addr) > 0);
    a.ptl.finalize();
    assert_eq!(net.registered_regions(a.addr), 0);
    assert_eq!(net.qp_count(a.addr), 0);
    assert_eq!(a.ptl.progress(), 0);
    assert_eq!(a.ptl.peer_state(b.name), None);
}
