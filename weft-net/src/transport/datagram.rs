//! Datagram transport: one socket, one worker per peer address.

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

/// Largest datagram we expect to receive.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Receives per readiness event before yielding back to the multiplexer.
const MAX_CONSECUTIVE_RECEIVES: usize = 50;

struct OutPacket {
    dest: SocketAddr,
    buf: BytesMut,
}

/// A transport over one unconnected datagram socket.
///
/// Each read yields one datagram plus the peer address; a
/// [`WorkerDispatcher`] keyed by that address owns one application per peer,
/// spawning a new worker when the first datagram from an unknown peer
/// arrives. Each send transmits one whole queued datagram; a transient
/// failure leaves the head queued for the next writable event.
pub struct DatagramTransport<F: ApplicationFactory> {
    socket: UdpSocket,
    dispatcher: WorkerDispatcher<F, SocketAddr>,
    queue: VecDeque<OutPacket>,
    pool: BufferPool,
    timers: TimerHandle,
    /// Which peer armed which timer, so fired timeouts route back.
    timer_owners: HashMap<u64, SocketAddr>,
    read_buf: Vec<u8>,
}

struct DatagramWriter<'a> {
    pool: &'a mut BufferPool,
    queue: &'a mut VecDeque<OutPacket>,
    dest: SocketAddr,
    timers: &'a TimerHandle,
    timer_owners: &'a mut HashMap<u64, SocketAddr>,
}

impl PacketWriter for DatagramWriter<'_> {
    fn next_header_buffer(&mut self) -> BytesMut {
        self.pool.next_header_buffer()
    }

    fn next_payload_buffer(&mut self) -> BytesMut {
        self.pool.next_payload_buffer()
    }

    fn write_packet(&mut self, mut header: BytesMut, payload: BytesMut) {
        header.extend_from_slice(&payload);
        self.pool.release_payload_buffer(payload);
        self.queue.push_back(OutPacket {
            dest: self.dest,
            buf: header,
        });
    }

    fn configure_read(&mut self, _policy: ReceivePolicy) {
        // Datagrams arrive whole; there is nothing to stage.
    }

    fn set_timeout(&mut self, deadline: Instant, tag: TimeoutTag) -> u64 {
        let id = self.timers.set_timeout(deadline, tag);
        self.timer_owners.insert(id, self.dest);
        id
    }

    fn cancel_timeout(&mut self, tag: TimeoutTag, id: u64) {
        self.timer_owners.remove(&id);
        self.timers.cancel_timeout(tag, id)
    }
}

impl<F: ApplicationFactory> DatagramTransport<F> {
    /// A datagram transport over `socket`, spawning applications from
    /// `factory`.
    pub fn new(
        socket: UdpSocket,
        factory: F,
        timers: TimerHandle,
        max_header_buffers: usize,
        max_payload_buffers: usize,
    ) -> Self {
        DatagramTransport {
            socket,
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

    /// Number of live peer workers.
    pub fn worker_count(&self) -> usize {
        self.dispatcher.len()
    }

    /// Route one datagram: spawn a worker on first contact, then feed it.
    /// A per-peer protocol failure removes that worker only; the socket
    /// keeps serving other peers.
    fn dispatch_datagram(&mut self, src: SocketAddr, len: usize) {
        let DatagramTransport {
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            read_buf,
            ..
        } = self;
        let mut writer = DatagramWriter {
            pool,
            queue,
            dest: src,
            timers,
            timer_owners,
        };
        let result = if let Some(worker) = dispatcher.get_mut(&src) {
            worker.handle_data(&mut writer, &read_buf[..len])
        } else {
            dispatcher
                .add_worker(src, &mut writer)
                .and_then(|worker| worker.handle_data(&mut writer, &read_buf[..len]))
        };
        if let Err(err) = result {
            warn!(peer = %src, %err, "datagram worker failed");
            self.dispatcher.remove(&src, &err);
        }
    }
}

impl<F: ApplicationFactory> Transport for DatagramTransport<F> {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.socket
    }

    fn init(&mut self) -> NetResult<()> {
        // Workers handshake individually as peers appear.
        Ok(())
    }

    fn handle_read_event(&mut self) -> NetResult<()> {
        for _ in 0..MAX_CONSECUTIVE_RECEIVES {
            match self.socket.recv_from(&mut self.read_buf) {
                Ok((len, src)) => {
                    trace!(bytes = len, peer = %src, "datagram received");
                    self.dispatch_datagram(src, len);
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
        let DatagramTransport {
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        let Some(worker) = dispatcher.worker_for_node(&msg.peer) else {
            debug!(peer = %msg.peer, "no worker for outbound message, dropping");
            return Ok(());
        };
        let dest = *worker.id();
        let mut writer = DatagramWriter {
            pool,
            queue,
            dest,
            timers,
            timer_owners,
        };
        worker.write_message(&mut writer, msg)
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        let dest = match resolve_addr(locator.host(), locator.port()) {
            Ok(dest) => dest,
            Err(err) => {
                listener.on_resolved(Err(err));
                return;
            }
        };
        let DatagramTransport {
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        let mut writer = DatagramWriter {
            pool,
            queue,
            dest,
            timers,
            timer_owners,
        };
        if let Some(worker) = dispatcher.get_mut(&dest) {
            worker.resolve(&mut writer, locator, listener);
            return;
        }
        // First contact with this peer: dial it with a fresh worker, whose
        // handshake rides ahead of the resolve request.
        match dispatcher.add_worker(dest, &mut writer) {
            Ok(worker) => worker.resolve(&mut writer, locator, listener),
            Err(err) => listener.on_resolved(Err(err)),
        }
    }

    fn timeout(&mut self, tag: TimeoutTag, id: u64) {
        let Some(dest) = self.timer_owners.remove(&id) else {
            return;
        };
        let DatagramTransport {
            dispatcher,
            queue,
            pool,
            timers,
            timer_owners,
            ..
        } = self;
        if let Some(worker) = dispatcher.get_mut(&dest) {
            let mut writer = DatagramWriter {
                pool,
                queue,
                dest,
                timers,
                timer_owners,
            };
            worker.timeout(&mut writer, tag, id);
        }
    }

    fn write_some(&mut self) -> NetResult<bool> {
        while let Some(packet) = self.queue.front() {
            match self.socket.send_to(&packet.buf, packet.dest) {
                Ok(sent) => {
                    if sent < packet.buf.len() {
                        warn!(
                            sent,
                            len = packet.buf.len(),
                            "datagram truncated by the socket"
                        );
                    }
                    trace!(bytes = sent, peer = %packet.dest, "datagram sent");
                    if let Some(done) = self.queue.pop_front() {
                        self.pool.release_header_buffer(done.buf);
                    }
                }
                // Transient: the head stays queued for the next event.
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
