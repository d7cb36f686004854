//! QUIC transport: a datagram socket demultiplexed by connection id.
//!
//! The QUIC machinery itself — crypto, transport parameters, stream
//! bookkeeping — is an external library behind the [`QuicStack`] /
//! [`QuicSession`] traits: UDP packets go in, stream bytes come out, and
//! vice versa. This transport owns the socket, classifies incoming
//! datagrams, accepts connections whose long-header version matches the
//! stack, answers mismatches with version negotiation and unknown
//! short-header packets with a stateless reset, and carries one application
//! worker per connection.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use mio::net::UdpSocket;
use tracing::{debug, trace, warn};
use weft_core::{Locator, NetError, NetResult};

use crate::endpoint::OutboundMessage;
use crate::multiplexer::TimeoutTag;
use crate::proxy::ResolveListener;
use crate::socket::resolve_addr;
use crate::transport::{
    ApplicationFactory, BufferPool, PacketWriter, ReceivePolicy, TimerHandle, Transport,
    WorkerDispatcher,
};

/// Identifies one QUIC connection within its stack.
pub type ConnectionId = u64;

/// Header form of a classified packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Long header: carries a version; starts handshakes.
    Long,
    /// Short header: belongs to an established connection.
    Short,
}

/// What the stack learned from a datagram without changing any state.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    /// Header form.
    pub kind: PacketKind,
    /// Wire version (long headers only; `0` for short headers).
    pub version: u32,
    /// The connection the packet belongs to, if the stack recognizes the
    /// destination connection id.
    pub conn: Option<ConnectionId>,
}

/// One established (or establishing) QUIC connection.
pub trait QuicSession: Send {
    /// The connection id this session is keyed under.
    fn id(&self) -> ConnectionId;

    /// The peer's UDP address.
    fn remote(&self) -> SocketAddr;

    /// Feed one incoming UDP packet to the connection.
    fn recv_packet(&mut self, datagram: &[u8]) -> NetResult<()>;

    /// Take stream bytes the connection has emitted for the application.
    fn take_stream_bytes(&mut self) -> Option<Vec<u8>>;

    /// Feed application bytes into the connection's bidirectional stream.
    fn send_stream_bytes(&mut self, bytes: &[u8]) -> NetResult<()>;

    /// Take one datagram the connection wants transmitted.
    fn take_datagram(&mut self) -> Option<(SocketAddr, Vec<u8>)>;

    /// Whether the connection is closed and can be reaped.
    fn is_closed(&self) -> bool;
}

/// The packet-in/packet-out surface of an external QUIC implementation.
pub trait QuicStack: Send {
    /// Session type produced by this stack.
    type Session: QuicSession;

    /// The protocol version this stack speaks.
    fn version(&self) -> u32;

    /// Classify a datagram without mutating connection state. `None` means
    /// undecodable; the packet is dropped.
    fn classify(&self, datagram: &[u8]) -> Option<PacketInfo>;

    /// Open a client connection to `peer`. The session's first datagrams
    /// carry the handshake.
    fn connect(&mut self, peer: SocketAddr) -> NetResult<Self::Session>;

    /// Accept a connection from a long-header packet with a matching
    /// version. The packet is consumed by the new session.
    fn accept(&mut self, datagram: &[u8], src: SocketAddr) -> NetResult<Self::Session>;

    /// The version-negotiation datagram answering a version mismatch.
    fn version_negotiation(&mut self, datagram: &[u8], src: SocketAddr) -> Option<Vec<u8>>;

    /// The stateless-reset datagram answering an unknown short-header
    /// packet, if the stack can produce one.
    fn stateless_reset(&mut self, datagram: &[u8], src: SocketAddr) -> Option<Vec<u8>>;
}

/// Largest datagram we expect to receive.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Receives per readiness event before yielding back to the multiplexer.
const MAX_CONSECUTIVE_RECEIVES: usize = 50;

struct OutPacket {
    dest: SocketAddr,
    buf: Vec<u8>,
}

struct QuicWriter<'a, S> {
    pool: &'a mut BufferPool,
    session: &'a mut S,
    conn: ConnectionId,
    timers: &'a TimerHandle,
    timer_owners: &'a mut HashMap<u64, ConnectionId>,
    error: Option<NetError>,
}

impl<S: QuicSession> PacketWriter for QuicWriter<'_, S> {
    fn next_header_buffer(&mut self) -> BytesMut {
        self.pool.next_header_buffer()
    }

    fn next_payload_buffer(&mut self) -> BytesMut {
        self.pool.next_payload_buffer()
    }

    fn write_packet(&mut self, mut header: BytesMut, payload: BytesMut) {
        header.extend_from_slice(&payload);
        self.pool.release_payload_buffer(payload);
        if let Err(err) = self.session.send_stream_bytes(&header) {
            warn!(conn = self.conn, %err, "stream write into session failed");
            self.error.get_or_insert(err);
        }
        self.pool.release_header_buffer(header);
    }

    fn configure_read(&mut self, _policy: ReceivePolicy) {
        // Stream chunk sizes are the session's business.
    }

    fn set_timeout(&mut self, deadline: Instant, tag: TimeoutTag) -> u64 {
        let id = self.timers.set_timeout(deadline, tag);
        self.timer_owners.insert(id, self.conn);
        id
    }

    fn cancel_timeout(&mut self, tag: TimeoutTag, id: u64) {
        self.timer_owners.remove(&id);
        self.timers.cancel_timeout(tag, id)
    }
}

/// A transport speaking QUIC over one UDP socket.
pub struct QuicTransport<F: ApplicationFactory, Q: QuicStack> {
    socket: UdpSocket,
    stack: Q,
    sessions: HashMap<ConnectionId, Q::Session>,
    dispatcher: WorkerDispatcher<F, ConnectionId>,
    queue: VecDeque<OutPacket>,
    pool: BufferPool,
    timers: TimerHandle,
    timer_owners: HashMap<u64, ConnectionId>,
    read_buf: Vec<u8>,
}

impl<F: ApplicationFactory, Q: QuicStack> QuicTransport<F, Q> {
    /// A QUIC transport over `socket`, using `stack` for the protocol and
    /// `factory` for per-connection applications.
    pub fn new(
        socket: UdpSocket,
        stack: Q,
        factory: F,
        timers: TimerHandle,
        max_header_buffers: usize,
        max_payload_buffers: usize,
    ) -> Self {
        QuicTransport {
            socket,
            stack,
            sessions: HashMap::new(),
            dispatcher: WorkerDispatcher::new(factory),
            queue: VecDeque::new(),
            pool: BufferPool::new(max_header_buffers, max_payload_buffers),
            timers,
            timer_owners: HashMap::new(),
            read_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// The local address of the socket.
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket.local_addr().map_err(NetError::from)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    fn handle_packet(&mut self, src: SocketAddr, len: usize) {
        let QuicTransport {
            stack,
            sessions,
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            read_buf,
            ..
        } = self;
        let data = &read_buf[..len];
        let Some(info) = stack.classify(data) else {
            trace!(peer = %src, "dropping undecodable datagram");
            return;
        };
        if info.kind == PacketKind::Long && info.version != stack.version() {
            debug!(peer = %src, version = info.version, "version mismatch");
            if let Some(reply) = stack.version_negotiation(data, src) {
                queue.push_back(OutPacket {
                    dest: src,
                    buf: reply,
                });
            }
            return;
        }
        let known = info.conn.filter(|cid| sessions.contains_key(cid));
        if let Some(cid) = known {
            let failed = {
                let Some(session) = sessions.get_mut(&cid) else {
                    return;
                };
                session.recv_packet(data).err()
            };
            match failed {
                Some(err) => {
                    warn!(conn = cid, %err, "session rejected packet");
                    Self::close_connection(cid, &err, sessions, dispatcher, timer_owners);
                }
                None => Self::pump_session(
                    cid,
                    sessions,
                    dispatcher,
                    queue,
                    pool,
                    timers,
                    timer_owners,
                ),
            }
        } else if info.kind == PacketKind::Long {
            // New connection attempt with a matching version.
            match stack.accept(data, src) {
                Ok(session) => {
                    let cid = session.id();
                    debug!(conn = cid, peer = %src, "accepted connection");
                    sessions.insert(cid, session);
                    let spawn_failed = {
                        let Some(session) = sessions.get_mut(&cid) else {
                            return;
                        };
                        let mut writer = QuicWriter {
                            pool: &mut *pool,
                            session,
                            conn: cid,
                            timers,
                            timer_owners: &mut *timer_owners,
                            error: None,
                        };
                        dispatcher.add_worker(cid, &mut writer).err()
                    };
                    match spawn_failed {
                        Some(err) => {
                            Self::close_connection(cid, &err, sessions, dispatcher, timer_owners)
                        }
                        None => Self::pump_session(
                            cid,
                            sessions,
                            dispatcher,
                            queue,
                            pool,
                            timers,
                            timer_owners,
                        ),
                    }
                }
                Err(err) => debug!(peer = %src, %err, "accept failed"),
            }
        } else if let Some(reset) = stack.stateless_reset(data, src) {
            // Short-header packet for a connection we do not know.
            trace!(peer = %src, "sending stateless reset");
            queue.push_back(OutPacket {
                dest: src,
                buf: reset,
            });
        }
    }

    /// Move emitted stream bytes into the worker and emitted datagrams into
    /// the send queue; reap the session if it closed.
    fn pump_session(
        cid: ConnectionId,
        sessions: &mut HashMap<ConnectionId, Q::Session>,
        dispatcher: &mut WorkerDispatcher<F, ConnectionId>,
        queue: &mut VecDeque<OutPacket>,
        pool: &mut BufferPool,
        timers: &TimerHandle,
        timer_owners: &mut HashMap<u64, ConnectionId>,
    ) {
        loop {
            let Some(session) = sessions.get_mut(&cid) else {
                return;
            };
            let Some(bytes) = session.take_stream_bytes() else {
                break;
            };
            let mut writer = QuicWriter {
                pool: &mut *pool,
                session,
                conn: cid,
                timers,
                timer_owners: &mut *timer_owners,
                error: None,
            };
            let result = match dispatcher.get_mut(&cid) {
                Some(worker) => worker.handle_data(&mut writer, &bytes),
                None => break,
            };
            let failure = writer.error.take().or(result.err());
            if let Some(err) = failure {
                warn!(conn = cid, %err, "worker failed");
                Self::close_connection(cid, &err, sessions, dispatcher, timer_owners);
                return;
            }
        }
        Self::flush_session(cid, sessions, queue);
        if sessions.get(&cid).is_some_and(QuicSession::is_closed) {
            Self::close_connection(
                cid,
                &NetError::Disconnected,
                sessions,
                dispatcher,
                timer_owners,
            );
        }
    }

    fn flush_session(
        cid: ConnectionId,
        sessions: &mut HashMap<ConnectionId, Q::Session>,
        queue: &mut VecDeque<OutPacket>,
    ) {
        if let Some(session) = sessions.get_mut(&cid) {
            while let Some((dest, buf)) = session.take_datagram() {
                queue.push_back(OutPacket { dest, buf });
            }
        }
    }

    fn close_connection(
        cid: ConnectionId,
        reason: &NetError,
        sessions: &mut HashMap<ConnectionId, Q::Session>,
        dispatcher: &mut WorkerDispatcher<F, ConnectionId>,
        timer_owners: &mut HashMap<u64, ConnectionId>,
    ) {
        debug!(conn = cid, %reason, "closing connection");
        sessions.remove(&cid);
        dispatcher.remove(&cid, reason);
        timer_owners.retain(|_, owner| *owner != cid);
    }

    fn session_for_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.sessions
            .values()
            .find(|session| session.remote() == addr)
            .map(QuicSession::id)
    }
}

impl<F: ApplicationFactory, Q: QuicStack> Transport for QuicTransport<F, Q> {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.socket
    }

    fn init(&mut self) -> NetResult<()> {
        // Connections handshake individually as they are opened or accepted.
        Ok(())
    }

    fn handle_read_event(&mut self) -> NetResult<()> {
        for _ in 0..MAX_CONSECUTIVE_RECEIVES {
            match self.socket.recv_from(&mut self.read_buf) {
                Ok((len, src)) => {
                    trace!(bytes = len, peer = %src, "quic datagram received");
                    self.handle_packet(src, len);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let err = NetError::from(err);
                    self.dispatcher.handle_error(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn write_message(&mut self, msg: OutboundMessage) -> NetResult<()> {
        let QuicTransport {
            sessions,
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        let Some(worker) = dispatcher.worker_for_node(&msg.peer) else {
            debug!(peer = %msg.peer, "no connection for outbound message, dropping");
            return Ok(());
        };
        let cid = *worker.id();
        let Some(session) = sessions.get_mut(&cid) else {
            return Ok(());
        };
        let mut writer = QuicWriter {
            pool: &mut *pool,
            session,
            conn: cid,
            timers,
            timer_owners: &mut *timer_owners,
            error: None,
        };
        let result = worker.write_message(&mut writer, msg);
        let failure = writer.error.take();
        Self::flush_session(cid, sessions, queue);
        if let Some(err) = failure {
            Self::close_connection(cid, &err, sessions, dispatcher, timer_owners);
            return Err(err);
        }
        result
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        let addr = match resolve_addr(locator.host(), locator.port()) {
            Ok(addr) => addr,
            Err(err) => {
                listener.on_resolved(Err(err));
                return;
            }
        };
        let cid = match self.session_for_addr(addr) {
            Some(cid) => cid,
            None => {
                // Dial: the session's handshake datagrams go out first.
                let session = match self.stack.connect(addr) {
                    Ok(session) => session,
                    Err(err) => {
                        listener.on_resolved(Err(err));
                        return;
                    }
                };
                let cid = session.id();
                debug!(conn = cid, peer = %addr, "dialed connection");
                self.sessions.insert(cid, session);
                let QuicTransport {
                    sessions,
                    dispatcher,
                    pool,
                    timers,
                    timer_owners,
                    ..
                } = self;
                let spawn_failed = {
                    let Some(session) = sessions.get_mut(&cid) else {
                        listener.on_resolved(Err(NetError::runtime("session vanished")));
                        return;
                    };
                    let mut writer = QuicWriter {
                        pool: &mut *pool,
                        session,
                        conn: cid,
                        timers,
                        timer_owners: &mut *timer_owners,
                        error: None,
                    };
                    dispatcher.add_worker(cid, &mut writer).err()
                };
                if let Some(err) = spawn_failed {
                    Self::close_connection(cid, &err, sessions, dispatcher, timer_owners);
                    listener.on_resolved(Err(err));
                    return;
                }
                cid
            }
        };
        let QuicTransport {
            sessions,
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&cid) else {
            listener.on_resolved(Err(NetError::Disconnected));
            return;
        };
        let mut writer = QuicWriter {
            pool,
            session,
            conn: cid,
            timers,
            timer_owners,
            error: None,
        };
        if let Some(worker) = dispatcher.get_mut(&cid) {
            worker.resolve(&mut writer, locator, listener);
        } else {
            listener.on_resolved(Err(NetError::Disconnected));
        }
        Self::flush_session(cid, sessions, queue);
    }

    fn timeout(&mut self, tag: TimeoutTag, id: u64) {
        let Some(cid) = self.timer_owners.remove(&id) else {
            return;
        };
        let QuicTransport {
            sessions,
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&cid) else {
            return;
        };
        if let Some(worker) = dispatcher.get_mut(&cid) {
            let mut writer = QuicWriter {
                pool,
                session,
                conn: cid,
                timers,
                timer_owners,
                error: None,
            };
            worker.timeout(&mut writer, tag, id);
        }
        Self::flush_session(cid, sessions, queue);
    }

    fn write_some(&mut self) -> NetResult<bool> {
        while let Some(packet) = self.queue.front() {
            match self.socket.send_to(&packet.buf, packet.dest) {
                Ok(sent) => {
                    trace!(bytes = sent, peer = %packet.dest, "quic datagram sent");
                    self.queue.pop_front();
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let err = NetError::from(err);
                    self.dispatcher.handle_error(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(false)
    }

    fn pending_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.buf.len()).sum()
    }

    fn handle_error(&mut self, err: NetError) {
        self.dispatcher.handle_error(err);
    }
}
