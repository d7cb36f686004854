//! End-to-end scenarios over real UDP sockets on the loopback interface,
//! with the ordering layer negotiated.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use weft_core::ActorId;
use weft_net::{NetConfig, NetworkModule};

use common::TestHost;

const WAIT: Duration = Duration::from_secs(5);

fn udp_module(origin: &str, host: Arc<TestHost>) -> NetworkModule {
    common::init_tracing();
    let cfg = NetConfig::new(origin.parse().expect("locator"));
    let mut module = NetworkModule::new(cfg, host).expect("module").with_udp();
    module.start().expect("start");
    module
}

#[test]
fn resolve_and_deliver_over_udp() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, inbox_b) = TestHost::new();
    host_b.publish("srv", ActorId(17));

    let mut a = udp_module("udp://a:1", host_a);
    let b = udp_module("udp://b:1", host_b);
    let b_port = b.port("udp").expect("udp port");

    let locator: weft_core::Locator = format!("udp://127.0.0.1:{b_port}/srv")
        .parse()
        .expect("locator");
    let proxy = a.resolve_sync(&locator, WAIT).expect("resolve");
    assert_eq!(proxy.node(), &b.this_node());
    assert_eq!(proxy.id(), ActorId(17));

    for i in 0..20u8 {
        proxy
            .tell(ActorId(3), Bytes::from(vec![i]))
            .expect("tell");
    }
    for i in 0..20u8 {
        let envelope = inbox_b.recv_timeout(WAIT).expect("delivery");
        assert_eq!(envelope.receiver, ActorId(17));
        assert_eq!(envelope.payload[0], i, "ordering layer must keep order");
    }

    a.stop();
    let mut b = b;
    b.stop();
}

#[test]
fn both_directions_share_the_socket() {
    let (host_a, inbox_a) = TestHost::new();
    let (host_b, inbox_b) = TestHost::new();
    host_a.publish("alpha", ActorId(1));
    host_b.publish("beta", ActorId(2));

    let mut a = udp_module("udp://a:2", host_a);
    let mut b = udp_module("udp://b:2", host_b);
    let a_port = a.port("udp").expect("port");
    let b_port = b.port("udp").expect("port");

    let to_beta: weft_core::Locator = format!("udp://127.0.0.1:{b_port}/beta")
        .parse()
        .expect("locator");
    let beta = a.resolve_sync(&to_beta, WAIT).expect("resolve beta");
    beta.tell(ActorId(1), Bytes::from_static(b"ping"))
        .expect("tell");
    assert_eq!(&inbox_b.recv_timeout(WAIT).expect("ping").payload[..], b"ping");

    let to_alpha: weft_core::Locator = format!("udp://127.0.0.1:{a_port}/alpha")
        .parse()
        .expect("locator");
    let alpha = b.resolve_sync(&to_alpha, WAIT).expect("resolve alpha");
    alpha
        .tell(ActorId(2), Bytes::from_static(b"pong"))
        .expect("tell");
    assert_eq!(&inbox_a.recv_timeout(WAIT).expect("pong").payload[..], b"pong");

    a.stop();
    b.stop();
}
