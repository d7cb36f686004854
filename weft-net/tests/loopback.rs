//! End-to-end scenarios over the test backend: two in-process nodes joined
//! by a socket pair, each with its own multiplexer thread.

mod common;

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use weft_core::{ActorId, NetError};
use weft_net::{BlockingResolve, OutboundItem, OutboundMessage};

use common::{test_backend, test_module, wire, TestHost};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn loopback_echo() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, inbox_b) = TestHost::new();
    host_b.publish("srv", ActorId(42));

    let mut a = test_module("test://a:1", host_a);
    let mut b = test_module("test://b:1", host_b);
    wire(&mut a, &mut b);

    let locator = "test://b:1/srv".parse().expect("locator");
    let proxy = a.resolve_sync(&locator, WAIT).expect("resolve");
    assert_eq!(proxy.node(), &b.this_node());
    assert_eq!(proxy.id(), ActorId(42));

    proxy
        .tell(ActorId(7), Bytes::from_static(b"hello"))
        .expect("tell");

    let envelope = inbox_b.recv_timeout(WAIT).expect("delivery");
    assert_eq!(envelope.sender, ActorId(7));
    assert_eq!(envelope.receiver, ActorId(42));
    assert_eq!(&envelope.payload[..], b"hello");
    assert_eq!(envelope.sender_node, a.this_node());

    a.stop();
    b.stop();
}

#[test]
fn resolve_returns_one_proxy_per_actor() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, _inbox_b) = TestHost::new();
    host_b.publish("srv", ActorId(5));

    let mut a = test_module("test://a:2", host_a);
    let mut b = test_module("test://b:2", host_b);
    wire(&mut a, &mut b);

    let locator = "test://b:2/srv".parse().expect("locator");
    let first = a.resolve_sync(&locator, WAIT).expect("first resolve");
    let second = a.resolve_sync(&locator, WAIT).expect("second resolve");
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    a.stop();
    b.stop();
}

#[test]
fn resolving_an_unknown_path_fails() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, _inbox_b) = TestHost::new();

    let mut a = test_module("test://a:3", host_a);
    let mut b = test_module("test://b:3", host_b);
    wire(&mut a, &mut b);

    let locator = "test://b:3/missing".parse().expect("locator");
    let err = a.resolve_sync(&locator, WAIT).expect_err("must fail");
    assert!(matches!(err, NetError::Runtime { .. }));

    a.stop();
    b.stop();
}

#[test]
fn version_mismatch_kills_the_connection() {
    let (host_a, _inbox_a) = TestHost::new();
    let mut a = test_module("test://a:4", host_a);

    // The "peer" is this test: it greets with the wrong protocol version.
    let peer_node = "test://b:4".parse::<weft_core::Locator>().expect("locator");
    let mut far_end = test_backend(&mut a)
        .emplace(peer_node.node_id())
        .expect("emplace");
    let mut bad_preamble = Vec::new();
    bad_preamble.extend_from_slice(&weft_net::basp::MAGIC.to_le_bytes());
    bad_preamble.extend_from_slice(&(weft_net::basp::VERSION + 1).to_le_bytes());
    far_end.write_all(&bad_preamble).expect("write");

    let locator = "test://b:4/srv".parse().expect("locator");
    let err = a.resolve_sync(&locator, WAIT).expect_err("must fail");
    assert!(matches!(
        err,
        NetError::Protocol { .. } | NetError::Disconnected | NetError::ShuttingDown
    ));

    a.stop();
}

#[test]
fn shutdown_drains_queued_work_with_errors() {
    let (host_a, _inbox_a) = TestHost::new();
    let mut a = test_module("test://a:5", host_a);

    // A peer that never answers: its end of the pair is simply held.
    let peer_node = "test://b:5".parse::<weft_core::Locator>().expect("locator");
    let _far_end = test_backend(&mut a)
        .emplace(peer_node.node_id())
        .expect("emplace");

    let manager = a
        .connect(&"test://b:5".parse().expect("locator"))
        .expect("connect");
    for i in 0..10u64 {
        manager
            .enqueue_message(OutboundMessage {
                peer: peer_node.node_id(),
                item: OutboundItem::Message {
                    sender: ActorId(1),
                    receiver: ActorId(2),
                    payload: Bytes::from(vec![i as u8; 128]),
                },
            })
            .expect("enqueue");
    }
    let (listener, pending) = BlockingResolve::pair();
    a.resolve("test://b:5/never".parse().expect("locator"), listener);

    // Stop must join the multiplexer thread and fail the listener rather
    // than leave it hanging.
    a.stop();
    let err = pending.wait(WAIT).expect_err("listener must fail");
    assert!(matches!(
        err,
        NetError::ShuttingDown | NetError::Disconnected
    ));
}

#[test]
fn messages_from_one_thread_arrive_in_order() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, inbox_b) = TestHost::new();
    host_b.publish("sink", ActorId(9));

    let mut a = test_module("test://a:6", host_a);
    let mut b = test_module("test://b:6", host_b);
    wire(&mut a, &mut b);

    let locator = "test://b:6/sink".parse().expect("locator");
    let proxy = a.resolve_sync(&locator, WAIT).expect("resolve");
    for i in 0..100u32 {
        proxy
            .tell(ActorId(1), Bytes::from(i.to_le_bytes().to_vec()))
            .expect("tell");
    }
    for i in 0..100u32 {
        let envelope = inbox_b.recv_timeout(WAIT).expect("delivery");
        let got = u32::from_le_bytes(
            envelope.payload[..4].try_into().expect("payload width"),
        );
        assert_eq!(got, i);
    }

    a.stop();
    b.stop();
}
