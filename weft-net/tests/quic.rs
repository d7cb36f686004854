//! QUIC transport scenarios over a mock packet-in/packet-out stack.
//!
//! The mock speaks a toy invariant-compatible format: long headers carry a
//! version and an 8-byte connection id, short headers just the connection
//! id. It moves application bytes verbatim, which is all the transport
//! contract requires.

mod common;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use weft_core::{ActorId, NetError, NetResult};
use weft_net::{
    NetConfig, NetworkModule, PacketInfo, PacketKind, QuicBackend, QuicSession, QuicStack,
};

use common::TestHost;

const WAIT: Duration = Duration::from_secs(5);
const TEST_VERSION: u32 = 7;

static NEXT_CID: AtomicU64 = AtomicU64::new(1);

const LONG_HEADER_LEN: usize = 13;
const SHORT_HEADER_LEN: usize = 9;

fn long_header(version: u32, cid: u64) -> Vec<u8> {
    let mut datagram = vec![0x80];
    datagram.extend_from_slice(&version.to_be_bytes());
    datagram.extend_from_slice(&cid.to_le_bytes());
    datagram
}

fn short_header(cid: u64) -> Vec<u8> {
    let mut datagram = vec![0x00];
    datagram.extend_from_slice(&cid.to_le_bytes());
    datagram
}

struct MockSession {
    id: u64,
    remote: SocketAddr,
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl QuicSession for MockSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn recv_packet(&mut self, datagram: &[u8]) -> NetResult<()> {
        let offset = if datagram[0] & 0x80 != 0 {
            LONG_HEADER_LEN
        } else {
            SHORT_HEADER_LEN
        };
        if datagram.len() > offset {
            self.inbound.push_back(datagram[offset..].to_vec());
        }
        Ok(())
    }

    fn take_stream_bytes(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }

    fn send_stream_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        let mut datagram = short_header(self.id);
        datagram.extend_from_slice(bytes);
        self.outbound.push_back((self.remote, datagram));
        Ok(())
    }

    fn take_datagram(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.outbound.pop_front()
    }

    fn is_closed(&self) -> bool {
        false
    }
}

struct MockStack;

impl QuicStack for MockStack {
    type Session = MockSession;

    fn version(&self) -> u32 {
        TEST_VERSION
    }

    fn classify(&self, datagram: &[u8]) -> Option<PacketInfo> {
        let first = *datagram.first()?;
        if first & 0x80 != 0 {
            if datagram.len() < LONG_HEADER_LEN {
                return None;
            }
            let version = u32::from_be_bytes(datagram[1..5].try_into().ok()?);
            let cid = u64::from_le_bytes(datagram[5..13].try_into().ok()?);
            Some(PacketInfo {
                kind: PacketKind::Long,
                version,
                conn: Some(cid),
            })
        } else {
            if datagram.len() < SHORT_HEADER_LEN {
                return None;
            }
            let cid = u64::from_le_bytes(datagram[1..9].try_into().ok()?);
            Some(PacketInfo {
                kind: PacketKind::Short,
                version: 0,
                conn: Some(cid),
            })
        }
    }

    fn connect(&mut self, peer: SocketAddr) -> NetResult<MockSession> {
        let cid = NEXT_CID.fetch_add(1, Ordering::Relaxed);
        let mut session = MockSession {
            id: cid,
            remote: peer,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        };
        // The "initial": a bare long-header datagram opening the connection.
        session
            .outbound
            .push_back((peer, long_header(TEST_VERSION, cid)));
        Ok(session)
    }

    fn accept(&mut self, datagram: &[u8], src: SocketAddr) -> NetResult<MockSession> {
        let info = self
            .classify(datagram)
            .ok_or_else(|| NetError::protocol("undecodable initial"))?;
        let cid = info
            .conn
            .ok_or_else(|| NetError::protocol("initial without connection id"))?;
        let mut session = MockSession {
            id: cid,
            remote: src,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        };
        if datagram.len() > LONG_HEADER_LEN {
            session.inbound.push_back(datagram[LONG_HEADER_LEN..].to_vec());
        }
        Ok(session)
    }

    fn version_negotiation(&mut self, _datagram: &[u8], _src: SocketAddr) -> Option<Vec<u8>> {
        Some(b"VNEG".to_vec())
    }

    fn stateless_reset(&mut self, _datagram: &[u8], _src: SocketAddr) -> Option<Vec<u8>> {
        Some(b"RST!".to_vec())
    }
}

fn quic_module(origin: &str, host: Arc<TestHost>) -> NetworkModule {
    common::init_tracing();
    let cfg = NetConfig::new(origin.parse().expect("locator"))
        // The mock ignores the directory, but the backend insists one is
        // configured.
        .with_quic_certificates("/tmp/weft-mock-certs".into());
    let module = NetworkModule::new(cfg, host).expect("module");
    let env = module.env().clone();
    let mut module =
        module.with_backend(Box::new(QuicBackend::new(env, 0, |_certs: &Path| {
            Ok(MockStack)
        })));
    module.start().expect("start");
    module
}

#[test]
fn resolve_and_deliver_over_quic() {
    let (host_a, _inbox_a) = TestHost::new();
    let (host_b, inbox_b) = TestHost::new();
    host_b.publish("srv", ActorId(23));

    let mut a = quic_module("quic://a:1", host_a);
    let mut b = quic_module("quic://b:1", host_b);
    let b_port = b.port("quic").expect("port");

    let locator: weft_core::Locator = format!("quic://127.0.0.1:{b_port}/srv")
        .parse()
        .expect("locator");
    let proxy = a.resolve_sync(&locator, WAIT).expect("resolve");
    assert_eq!(proxy.node(), &b.this_node());
    assert_eq!(proxy.id(), ActorId(23));

    proxy
        .tell(ActorId(4), Bytes::from_static(b"over quic"))
        .expect("tell");
    let envelope = inbox_b.recv_timeout(WAIT).expect("delivery");
    assert_eq!(envelope.receiver, ActorId(23));
    assert_eq!(&envelope.payload[..], b"over quic");

    a.stop();
    b.stop();
}

#[test]
fn version_mismatch_triggers_negotiation() {
    let (host, _inbox) = TestHost::new();
    let mut module = quic_module("quic://vn:1", host);
    let port = module.port("quic").expect("port");

    let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe socket");
    probe
        .set_read_timeout(Some(WAIT))
        .expect("read timeout");
    probe
        .send_to(&long_header(99, 1234), ("127.0.0.1", port))
        .expect("send");

    let mut buf = [0u8; 64];
    let (len, _) = probe.recv_from(&mut buf).expect("negotiation reply");
    assert_eq!(&buf[..len], b"VNEG");

    module.stop();
}

#[test]
fn unknown_short_header_triggers_stateless_reset() {
    let (host, _inbox) = TestHost::new();
    let mut module = quic_module("quic://rst:1", host);
    let port = module.port("quic").expect("port");

    let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe socket");
    probe
        .set_read_timeout(Some(WAIT))
        .expect("read timeout");
    probe
        .send_to(&short_header(0xdead_beef), ("127.0.0.1", port))
        .expect("send");

    let mut buf = [0u8; 64];
    let (len, _) = probe.recv_from(&mut buf).expect("reset reply");
    assert_eq!(&buf[..len], b"RST!");

    module.stop();
}
