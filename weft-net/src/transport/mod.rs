//! Transport policies and the application contract.
//!
//! A transport owns the socket I/O for one endpoint manager: it pulls bytes
//! off the wire into a read buffer and pushes queued packets onto the wire.
//! Framing and protocol logic live one layer up, in an [`Application`]
//! driven by the transport. The two meet at the [`PacketWriter`] seam: the
//! application obtains pooled buffers, hands back framed packets, and steers
//! the transport's read policy.

use std::time::Instant;

use bytes::BytesMut;
use weft_core::{Locator, NetError, NetResult};

use crate::multiplexer::{MultiplexerHandle, TimeoutTag};
use crate::proxy::ResolveListener;

pub mod buffer;
pub mod datagram;
pub mod quic;
pub mod stream;
pub mod worker;

pub use buffer::BufferPool;
pub use datagram::DatagramTransport;
pub use quic::{PacketInfo, PacketKind, QuicSession, QuicStack, QuicTransport};
pub use stream::StreamTransport;
pub use worker::{TransportWorker, WorkerDispatcher};

use crate::endpoint::OutboundMessage;

/// How much data the transport should collect before delivering it to the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Deliver exactly `n` bytes; buffer short reads until then.
    Exactly(usize),
    /// Deliver whatever arrives, up to `n` bytes.
    AtMost(usize),
    /// Deliver once at least `n` bytes have accumulated.
    AtLeast(usize),
}

impl ReceivePolicy {
    /// Size of the read buffer this policy wants.
    pub fn buffer_size(&self) -> usize {
        match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtMost(n) => n,
            // Leave headroom so one read can overshoot the threshold.
            ReceivePolicy::AtLeast(n) => n + std::cmp::max(100, n / 10),
        }
    }

    /// Bytes that must be collected before delivery.
    pub fn threshold(&self) -> usize {
        match *self {
            ReceivePolicy::Exactly(n) | ReceivePolicy::AtLeast(n) => n,
            ReceivePolicy::AtMost(_) => 1,
        }
    }
}

/// Timer access for transports and applications, routed through the
/// multiplexer's pending queue so it is safe from any thread.
#[derive(Clone)]
pub struct TimerHandle {
    mpx: MultiplexerHandle,
    token: mio::Token,
}

impl TimerHandle {
    /// A timer handle arming timeouts for `token`.
    pub fn new(mpx: MultiplexerHandle, token: mio::Token) -> Self {
        TimerHandle { mpx, token }
    }

    /// Arm a timeout; the owning endpoint manager receives a timeout control
    /// event when the deadline passes.
    pub fn set_timeout(&self, deadline: Instant, tag: TimeoutTag) -> u64 {
        self.mpx.set_timeout(self.token, deadline, tag)
    }

    /// Suppress delivery of a previously armed timeout.
    pub fn cancel_timeout(&self, tag: TimeoutTag, id: u64) {
        self.mpx.cancel_timeout(tag, id)
    }
}

/// What an application sees of its transport while handling a callback.
pub trait PacketWriter {
    /// Obtain a pooled buffer for a frame header.
    fn next_header_buffer(&mut self) -> BytesMut;

    /// Obtain a pooled buffer for a frame payload.
    fn next_payload_buffer(&mut self) -> BytesMut;

    /// Enqueue a packet for transmission. Header and payload are framed
    /// atomically; an empty payload is allowed.
    fn write_packet(&mut self, header: BytesMut, payload: BytesMut);

    /// Change the transport's read policy.
    fn configure_read(&mut self, policy: ReceivePolicy);

    /// Arm a timeout for the owning endpoint manager.
    fn set_timeout(&mut self, deadline: Instant, tag: TimeoutTag) -> u64;

    /// Suppress a previously armed timeout.
    fn cancel_timeout(&mut self, tag: TimeoutTag, id: u64);
}

/// The protocol layer sitting on top of a transport.
///
/// One instance serves one peer. All callbacks run on the multiplexer
/// thread; `handle_data` receives chunks sized by the read policy the
/// application configured.
pub trait Application: Send {
    /// Begin the handshake. Called once, before the manager joins the poll
    /// set; may write packets.
    fn init(&mut self, writer: &mut dyn PacketWriter) -> NetResult<()>;

    /// Inbound bytes, sized per the configured [`ReceivePolicy`].
    fn handle_data(&mut self, writer: &mut dyn PacketWriter, data: &[u8]) -> NetResult<()>;

    /// Serialize and frame one outbound message.
    fn write_message(&mut self, writer: &mut dyn PacketWriter, msg: OutboundMessage)
        -> NetResult<()>;

    /// Ask the peer for the actor published at `locator`'s path.
    fn resolve(
        &mut self,
        writer: &mut dyn PacketWriter,
        locator: Locator,
        listener: Box<dyn ResolveListener>,
    );

    /// A timeout armed by this application fired.
    fn timeout(&mut self, writer: &mut dyn PacketWriter, tag: TimeoutTag, id: u64);

    /// The connection is going away; fail pending work.
    fn handle_error(&mut self, err: NetError);

    /// The peer's node id, once the handshake learned it.
    fn peer(&self) -> Option<weft_core::NodeId> {
        None
    }
}

/// Builds one application instance per peer. Stream transports use it once;
/// datagram and QUIC transports once per remote endpoint.
pub trait ApplicationFactory: Send {
    /// The application type this factory produces.
    type Application: Application;

    /// Create a fresh application for one peer.
    fn make(&self) -> Self::Application;
}

/// The byte-level I/O policy owned by an endpoint manager.
///
/// All methods run on the multiplexer thread. Fatal errors are reported to
/// the application (via `handle_error`) by the transport itself before the
/// erring call returns; the endpoint manager only decides registration.
pub trait Transport: Send {
    /// The mio source to register with the poll set.
    fn source(&mut self) -> &mut dyn mio::event::Source;

    /// Run the application handshake. Called before registration.
    fn init(&mut self) -> NetResult<()>;

    /// The socket is readable: pull bytes and feed the application.
    /// `Err` means the manager must unregister (EOF or fatal error).
    fn handle_read_event(&mut self) -> NetResult<()>;

    /// Frame one outbound message through the application.
    fn write_message(&mut self, msg: OutboundMessage) -> NetResult<()>;

    /// Forward a resolve control event to the application.
    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>);

    /// Forward a timeout control event to the application.
    fn timeout(&mut self, tag: TimeoutTag, id: u64);

    /// Push queued packets onto the wire. Returns whether data remains
    /// queued; `Err` means the manager must unregister.
    fn write_some(&mut self) -> NetResult<bool>;

    /// Bytes currently queued for transmission.
    fn pending_bytes(&self) -> usize;

    /// Whether any packet is queued for transmission.
    fn has_pending(&self) -> bool {
        self.pending_bytes() > 0
    }

    /// Report a connection-level error to the application.
    fn handle_error(&mut self, err: NetError);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_policy_thresholds() {
        assert_eq!(ReceivePolicy::Exactly(21).threshold(), 21);
        assert_eq!(ReceivePolicy::Exactly(21).buffer_size(), 21);
        assert_eq!(ReceivePolicy::AtMost(1024).threshold(), 1);
        assert_eq!(ReceivePolicy::AtLeast(1024).threshold(), 1024);
        assert!(ReceivePolicy::AtLeast(1024).buffer_size() > 1024);
        assert_eq!(ReceivePolicy::AtLeast(10).buffer_size(), 110);
    }
}
