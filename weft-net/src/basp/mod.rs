//! BASP: the default application carrying actor messages between nodes.
//!
//! A small framed protocol layered on any transport. Connections open with
//! a magic/version preamble and a handshake frame exchanging node ids and
//! capabilities, then enter the running state where message, heartbeat,
//! resolve, monitor and down frames flow. Frame parsing is incremental: the
//! application buffers partial input, so it works unchanged whether the
//! transport delivers policy-sized chunks (stream), whole datagrams, or
//! arbitrary QUIC stream fragments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use weft_core::{ActorHost, ActorId, Envelope, Locator, NetError, NetResult, NodeId};

mod header;
mod ordering;

pub use header::{
    FrameError, FrameHeader, OpCode, FLAG_ORDERING, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE,
    PREAMBLE_SIZE, SEQUENCE_SIZE, VERSION,
};
pub use ordering::{seq_before, Accept, SequenceWindow, SEQUENCE_WINDOW};

use crate::endpoint::{EndpointManager, OutboundItem, OutboundMessage};
use crate::multiplexer::TimeoutTag;
use crate::proxy::{ProxyRegistry, ResolveListener};
use crate::transport::{Application, ApplicationFactory, PacketWriter, ReceivePolicy};

/// How long a reorder hole may stall delivery before it is skipped.
const HOLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-connection protocol configuration.
#[derive(Clone)]
pub struct BaspConfig {
    /// The local node id announced in the handshake.
    pub node: NodeId,
    /// Offer the ordering layer; active only when both sides offer it.
    pub ordering: bool,
    /// Emit heartbeat frames at this interval once running.
    pub heartbeat_interval: Option<Duration>,
}

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingMagic,
    AwaitingHandshake,
    Running,
    Shutdown,
}

/// What the incremental parser expects next.
enum ReadStage {
    Preamble,
    FrameHeader,
    FramePayload { header: FrameHeader },
}

/// Work arriving before the handshake completed.
enum Deferred {
    Resolve(Locator, Box<dyn ResolveListener>),
    Message(OutboundMessage),
}

/// The BASP protocol state machine for one peer.
pub struct BaspApplication {
    cfg: BaspConfig,
    host: Arc<dyn ActorHost>,
    proxies: Arc<ProxyRegistry>,
    manager: Arc<EndpointManager>,
    phase: Phase,
    stage: ReadStage,
    buffer: BytesMut,
    peer: Option<NodeId>,
    ordering_active: bool,
    out_seq: u16,
    window: SequenceWindow<(FrameHeader, Bytes)>,
    ordering_timer: Option<u64>,
    pending_resolves: HashMap<u64, Box<dyn ResolveListener>>,
    next_request_id: u64,
    deferred: Vec<Deferred>,
    heartbeats_received: u64,
}

impl BaspApplication {
    /// A fresh state machine for one connection.
    pub fn new(
        cfg: BaspConfig,
        host: Arc<dyn ActorHost>,
        proxies: Arc<ProxyRegistry>,
        manager: Arc<EndpointManager>,
    ) -> Self {
        BaspApplication {
            cfg,
            host,
            proxies,
            manager,
            phase: Phase::AwaitingMagic,
            stage: ReadStage::Preamble,
            buffer: BytesMut::new(),
            peer: None,
            ordering_active: false,
            out_seq: 0,
            window: SequenceWindow::new(),
            ordering_timer: None,
            pending_resolves: HashMap::new(),
            next_request_id: 1,
            deferred: Vec::new(),
            heartbeats_received: 0,
        }
    }

    /// Heartbeat frames received so far.
    pub fn heartbeats_received(&self) -> u64 {
        self.heartbeats_received
    }

    /// Whether both sides negotiated the ordering layer.
    pub fn ordering_active(&self) -> bool {
        self.ordering_active
    }

    fn seq_in_frames(&self) -> bool {
        self.ordering_active && self.phase == Phase::Running
    }

    /// Bytes the parser needs before the current stage completes.
    fn stage_need(&self) -> usize {
        match &self.stage {
            ReadStage::Preamble => PREAMBLE_SIZE,
            ReadStage::FrameHeader => HEADER_SIZE,
            ReadStage::FramePayload { header } => {
                let seq = if self.seq_in_frames() { SEQUENCE_SIZE } else { 0 };
                seq + header.payload_len as usize
            }
        }
    }

    fn write_frame(
        &mut self,
        writer: &mut dyn PacketWriter,
        op: OpCode,
        sender: ActorId,
        receiver: ActorId,
        payload: &[u8],
    ) {
        let mut head = writer.next_header_buffer();
        FrameHeader {
            op,
            sender,
            receiver,
            payload_len: payload.len() as u32,
        }
        .encode(&mut head);
        if self.seq_in_frames() {
            head.put_u16_le(self.out_seq);
            self.out_seq = self.out_seq.wrapping_add(1);
        }
        let mut body = writer.next_payload_buffer();
        body.extend_from_slice(payload);
        writer.write_packet(head, body);
    }

    fn fail_pending(&mut self, err: &NetError) {
        for (_, listener) in self.pending_resolves.drain() {
            listener.on_resolved(Err(err.clone()));
        }
        for deferred in self.deferred.drain(..) {
            if let Deferred::Resolve(_, listener) = deferred {
                listener.on_resolved(Err(err.clone()));
            }
        }
    }

    fn enter_shutdown(&mut self, err: NetError) -> NetError {
        self.phase = Phase::Shutdown;
        self.fail_pending(&err);
        err
    }

    fn send_resolve(
        &mut self,
        writer: &mut dyn PacketWriter,
        locator: Locator,
        listener: Box<dyn ResolveListener>,
    ) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        trace!(request_id, path = locator.path(), "sending resolve request");
        self.pending_resolves.insert(request_id, listener);
        let mut payload = BytesMut::new();
        header::encode_resolve_request(&mut payload, request_id, locator.path());
        self.write_frame(
            writer,
            OpCode::ResolveRequest,
            ActorId::INVALID,
            ActorId::INVALID,
            &payload,
        );
    }

    fn arm_heartbeat(&mut self, writer: &mut dyn PacketWriter) {
        if let Some(interval) = self.cfg.heartbeat_interval {
            writer.set_timeout(Instant::now() + interval, TimeoutTag::Heartbeat);
        }
    }

    fn enter_running(&mut self, writer: &mut dyn PacketWriter) -> NetResult<()> {
        self.phase = Phase::Running;
        self.arm_heartbeat(writer);
        for deferred in std::mem::take(&mut self.deferred) {
            match deferred {
                Deferred::Resolve(locator, listener) => {
                    self.send_resolve(writer, locator, listener)
                }
                Deferred::Message(msg) => self.frame_item(writer, msg.item),
            }
        }
        Ok(())
    }

    fn frame_item(&mut self, writer: &mut dyn PacketWriter, item: OutboundItem) {
        match item {
            OutboundItem::Message {
                sender,
                receiver,
                payload,
            } => self.write_frame(writer, OpCode::Message, sender, receiver, &payload),
            OutboundItem::Monitor { receiver } => {
                self.write_frame(writer, OpCode::Monitor, ActorId::INVALID, receiver, &[])
            }
            OutboundItem::Down { actor, reason } => self.write_frame(
                writer,
                OpCode::Down,
                actor,
                ActorId::INVALID,
                reason.as_bytes(),
            ),
        }
    }

    /// Process one complete frame that cleared the ordering layer.
    fn dispatch_frame(
        &mut self,
        writer: &mut dyn PacketWriter,
        frame: FrameHeader,
        payload: Bytes,
    ) -> NetResult<()> {
        let Some(peer) = self.peer.clone() else {
            return Err(self.enter_shutdown(NetError::protocol("frame before handshake")));
        };
        match frame.op {
            OpCode::Handshake => {
                // A second handshake is a protocol violation.
                Err(self.enter_shutdown(NetError::protocol("unexpected handshake frame")))
            }
            OpCode::Message => {
                self.host.deliver(Envelope {
                    sender_node: peer,
                    sender: frame.sender,
                    receiver: frame.receiver,
                    payload,
                });
                Ok(())
            }
            OpCode::Heartbeat => {
                self.heartbeats_received += 1;
                Ok(())
            }
            OpCode::ResolveRequest => {
                let (request_id, path) = header::decode_resolve_request(&payload)?;
                let actor = self.host.lookup(path).unwrap_or(ActorId::INVALID);
                let interfaces = if actor.is_valid() {
                    self.host.interfaces_of(actor)
                } else {
                    Vec::new()
                };
                trace!(request_id, path, %actor, "answering resolve request");
                let mut response = BytesMut::new();
                header::encode_resolve_response(&mut response, request_id, actor, &interfaces);
                self.write_frame(
                    writer,
                    OpCode::ResolveResponse,
                    ActorId::INVALID,
                    ActorId::INVALID,
                    &response,
                );
                Ok(())
            }
            OpCode::ResolveResponse => {
                let (request_id, actor, _interfaces) =
                    header::decode_resolve_response(&payload)?;
                let Some(listener) = self.pending_resolves.remove(&request_id) else {
                    debug!(request_id, "resolve response without a listener");
                    return Ok(());
                };
                if actor.is_valid() {
                    let proxy = self.proxies.get_or_make(peer, actor, &self.manager);
                    listener.on_resolved(Ok(proxy));
                } else {
                    listener.on_resolved(Err(NetError::runtime("no actor published at path")));
                }
                Ok(())
            }
            OpCode::Monitor => {
                let actor = frame.receiver;
                let manager = Arc::clone(&self.manager);
                let peer_node = peer;
                self.host.watch(
                    actor,
                    Box::new(move |dead: ActorId| {
                        let result = manager.enqueue_message(OutboundMessage {
                            peer: peer_node,
                            item: OutboundItem::Down {
                                actor: dead,
                                reason: "terminated".to_string(),
                            },
                        });
                        if let Err(err) = result {
                            debug!(%err, "down notification dropped");
                        }
                    }),
                );
                Ok(())
            }
            OpCode::Down => {
                let actor = frame.sender;
                self.proxies.erase(&peer, actor);
                self.host.peer_down(&peer, actor);
                Ok(())
            }
        }
    }

    fn handle_handshake_frame(
        &mut self,
        writer: &mut dyn PacketWriter,
        frame: FrameHeader,
        payload: &[u8],
    ) -> NetResult<()> {
        if frame.op != OpCode::Handshake {
            return Err(self.enter_shutdown(NetError::protocol(format!(
                "expected handshake, got {:?}",
                frame.op
            ))));
        }
        let (flags, peer) = header::decode_handshake(payload)
            .map_err(|err| self.enter_shutdown(err.into()))?;
        debug!(peer = %peer, flags, "handshake complete");
        self.ordering_active = self.cfg.ordering && (flags & FLAG_ORDERING) != 0;
        self.peer = Some(peer);
        self.enter_running(writer)
    }

    /// Run one complete frame through the (optional) ordering layer.
    fn sequence_frame(
        &mut self,
        writer: &mut dyn PacketWriter,
        frame: FrameHeader,
        seq: Option<u16>,
        payload: Bytes,
    ) -> NetResult<()> {
        let Some(seq) = seq else {
            return self.dispatch_frame(writer, frame, payload);
        };
        match self.window.accept(seq, (frame, payload)) {
            Accept::Deliver(frames) => {
                for (frame, payload) in frames {
                    self.dispatch_frame(writer, frame, payload)?;
                }
                if !self.window.has_pending() {
                    if let Some(id) = self.ordering_timer.take() {
                        writer.cancel_timeout(TimeoutTag::Ordering, id);
                    }
                }
                Ok(())
            }
            Accept::Buffered => {
                if self.ordering_timer.is_none() {
                    let id =
                        writer.set_timeout(Instant::now() + HOLE_TIMEOUT, TimeoutTag::Ordering);
                    self.ordering_timer = Some(id);
                }
                Ok(())
            }
            Accept::Duplicate => {
                trace!(seq, "dropping duplicate frame");
                Ok(())
            }
        }
    }
}

impl Application for BaspApplication {
    fn init(&mut self, writer: &mut dyn PacketWriter) -> NetResult<()> {
        writer.configure_read(ReceivePolicy::Exactly(PREAMBLE_SIZE));
        let mut preamble = writer.next_header_buffer();
        header::encode_preamble(&mut preamble);
        let empty = writer.next_payload_buffer();
        writer.write_packet(preamble, empty);

        let flags = if self.cfg.ordering { FLAG_ORDERING } else { 0 };
        let mut payload = BytesMut::new();
        header::encode_handshake(&mut payload, flags, &self.cfg.node);
        self.write_frame(
            writer,
            OpCode::Handshake,
            ActorId::INVALID,
            ActorId::INVALID,
            &payload,
        );
        Ok(())
    }

    fn handle_data(&mut self, writer: &mut dyn PacketWriter, data: &[u8]) -> NetResult<()> {
        if self.phase == Phase::Shutdown {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        loop {
            let need = self.stage_need();
            if self.buffer.len() < need {
                writer.configure_read(ReceivePolicy::Exactly(need - self.buffer.len()));
                return Ok(());
            }
            let chunk = self.buffer.split_to(need);
            match std::mem::replace(&mut self.stage, ReadStage::FrameHeader) {
                ReadStage::Preamble => {
                    if let Err(err) = header::decode_preamble(&chunk) {
                        warn!(%err, "rejecting peer");
                        return Err(self.enter_shutdown(err.into()));
                    }
                    self.phase = Phase::AwaitingHandshake;
                    self.stage = ReadStage::FrameHeader;
                }
                ReadStage::FrameHeader => {
                    let frame = FrameHeader::decode(&chunk)
                        .map_err(|err| self.enter_shutdown(err.into()))?;
                    self.stage = ReadStage::FramePayload { header: frame };
                }
                ReadStage::FramePayload { header: frame } => {
                    self.stage = ReadStage::FrameHeader;
                    let mut chunk = chunk;
                    let seq = if self.seq_in_frames() {
                        let seq_bytes = chunk.split_to(SEQUENCE_SIZE);
                        Some(u16::from_le_bytes([seq_bytes[0], seq_bytes[1]]))
                    } else {
                        None
                    };
                    let payload = chunk.freeze();
                    match self.phase {
                        Phase::AwaitingHandshake => {
                            self.handle_handshake_frame(writer, frame, &payload)?
                        }
                        Phase::Running => self.sequence_frame(writer, frame, seq, payload)?,
                        Phase::AwaitingMagic | Phase::Shutdown => {
                            return Err(self
                                .enter_shutdown(NetError::protocol("frame in invalid phase")));
                        }
                    }
                }
            }
        }
    }

    fn write_message(
        &mut self,
        writer: &mut dyn PacketWriter,
        msg: OutboundMessage,
    ) -> NetResult<()> {
        match self.phase {
            Phase::Running => {
                self.frame_item(writer, msg.item);
                Ok(())
            }
            Phase::Shutdown => Err(NetError::Disconnected),
            // Handshake still in flight; hold the message back.
            Phase::AwaitingMagic | Phase::AwaitingHandshake => {
                self.deferred.push(Deferred::Message(msg));
                Ok(())
            }
        }
    }

    fn resolve(
        &mut self,
        writer: &mut dyn PacketWriter,
        locator: Locator,
        listener: Box<dyn ResolveListener>,
    ) {
        match self.phase {
            Phase::Running => self.send_resolve(writer, locator, listener),
            Phase::Shutdown => listener.on_resolved(Err(NetError::Disconnected)),
            Phase::AwaitingMagic | Phase::AwaitingHandshake => {
                self.deferred.push(Deferred::Resolve(locator, listener));
            }
        }
    }

    fn timeout(&mut self, writer: &mut dyn PacketWriter, tag: TimeoutTag, id: u64) {
        match tag {
            TimeoutTag::Heartbeat => {
                if self.phase == Phase::Running {
                    trace!("emitting heartbeat");
                    self.write_frame(
                        writer,
                        OpCode::Heartbeat,
                        ActorId::INVALID,
                        ActorId::INVALID,
                        &[],
                    );
                    self.arm_heartbeat(writer);
                }
            }
            TimeoutTag::Ordering => {
                if self.ordering_timer == Some(id) {
                    self.ordering_timer = None;
                    if self.window.has_pending() {
                        debug!(expected = self.window.expected(), "skipping reorder hole");
                        for (frame, payload) in self.window.skip_hole() {
                            if let Err(err) = self.dispatch_frame(writer, frame, payload) {
                                warn!(%err, "frame dispatch failed after hole skip");
                                return;
                            }
                        }
                        if self.window.has_pending() {
                            let next = writer
                                .set_timeout(Instant::now() + HOLE_TIMEOUT, TimeoutTag::Ordering);
                            self.ordering_timer = Some(next);
                        }
                    }
                }
            }
            TimeoutTag::Resolve => {}
        }
    }

    fn handle_error(&mut self, err: NetError) {
        if self.phase != Phase::Shutdown {
            if err.is_clean_close() {
                debug!(peer = ?self.peer, "connection closed");
            } else {
                warn!(peer = ?self.peer, %err, "connection failed");
            }
        }
        self.phase = Phase::Shutdown;
        self.fail_pending(&err);
    }

    fn peer(&self) -> Option<NodeId> {
        self.peer.clone()
    }
}

/// Spawns one [`BaspApplication`] per peer for demultiplexing transports.
pub struct BaspFactory {
    cfg: BaspConfig,
    host: Arc<dyn ActorHost>,
    proxies: Arc<ProxyRegistry>,
    manager: Arc<EndpointManager>,
}

impl BaspFactory {
    /// A factory stamping applications with shared registries.
    pub fn new(
        cfg: BaspConfig,
        host: Arc<dyn ActorHost>,
        proxies: Arc<ProxyRegistry>,
        manager: Arc<EndpointManager>,
    ) -> Self {
        BaspFactory {
            cfg,
            host,
            proxies,
            manager,
        }
    }
}

impl ApplicationFactory for BaspFactory {
    type Application = BaspApplication;

    fn make(&self) -> BaspApplication {
        BaspApplication::new(
            self.cfg.clone(),
            Arc::clone(&self.host),
            Arc::clone(&self.proxies),
            Arc::clone(&self.manager),
        )
    }
}
