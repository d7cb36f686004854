//! Endpoint managers: one peer, one socket, two inboxes.
//!
//! An endpoint manager is split along the thread boundary. The
//! [`EndpointManager`] half is shared — the proxy registry, the backend and
//! any actor-runtime thread enqueue into its two FIFO inboxes. The
//! [`EndpointDriver`] half lives on the multiplexer thread, owns the
//! transport (and through it the socket), and sequences queue drains with
//! byte-level I/O. Writes touch the socket only from the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};
use weft_core::{ActorId, Locator, NetError, NetResult, NodeId};

use crate::inbox::{DrrArbiter, Inbox, TaskSize};
use crate::instrument::{Instrumentation, Stage};
use crate::multiplexer::{MpxContext, MultiplexerHandle, SocketManager, TimeoutTag};
use crate::proxy::ResolveListener;
use crate::transport::Transport;

/// Flush the transport once its queue holds this many bytes while draining
/// the message inbox; a full socket buffer then stops the drain.
const HIGH_WATERMARK: usize = 64 * 1024;

/// A queued control event.
pub enum ControlEvent {
    /// Ask the peer for the actor published at the locator's path.
    Resolve {
        /// Full locator; datagram transports use the authority to pick the
        /// peer, stream transports only read the path.
        locator: Locator,
        /// Receives the proxy or an error.
        listener: Box<dyn ResolveListener>,
    },
    /// A timer armed for this manager fired.
    Timeout {
        /// Timer family.
        tag: TimeoutTag,
        /// Timer id returned by `set_timeout`.
        id: u64,
    },
}

impl TaskSize for ControlEvent {
    fn task_size(&self) -> usize {
        1
    }
}

/// What an outbound queue entry asks the application to transmit.
pub enum OutboundItem {
    /// A serialized actor message.
    Message {
        /// Sending actor ([`ActorId::INVALID`] for anonymous sends).
        sender: ActorId,
        /// Receiving actor on the peer.
        receiver: ActorId,
        /// Serialized payload, computed when the proxy enqueued.
        payload: Bytes,
    },
    /// Start monitoring a remote actor (sent when a proxy is created).
    Monitor {
        /// The remote actor to watch.
        receiver: ActorId,
    },
    /// A local actor watched by the peer has terminated.
    Down {
        /// The terminated local actor.
        actor: ActorId,
        /// Human-readable exit reason.
        reason: String,
    },
}

/// An entry in the outbound-message inbox: routing plus item.
pub struct OutboundMessage {
    /// The node this message must reach.
    pub peer: NodeId,
    /// What to transmit.
    pub item: OutboundItem,
}

impl TaskSize for OutboundMessage {
    fn task_size(&self) -> usize {
        match &self.item {
            OutboundItem::Message { payload, .. } => payload.len().max(1),
            OutboundItem::Monitor { .. } | OutboundItem::Down { .. } => 1,
        }
    }
}

/// The thread-safe half of an endpoint manager.
///
/// Shared by the proxy registry, the backend, and the multiplexer; it lives
/// as long as the longest holder. The inboxes are the only state mutable
/// from outside the multiplexer thread.
pub struct EndpointManager {
    token: Token,
    mpx: MultiplexerHandle,
    events: Inbox<ControlEvent>,
    messages: Inbox<OutboundMessage>,
    /// Whether the write mask is (believed) set; deduplicates wakeups.
    writing: AtomicBool,
    instrumentation: Arc<Instrumentation>,
}

impl EndpointManager {
    /// A manager bound to an already-allocated token.
    pub fn new(
        mpx: MultiplexerHandle,
        token: Token,
        instrumentation: Arc<Instrumentation>,
    ) -> Arc<Self> {
        Arc::new(EndpointManager {
            token,
            mpx,
            events: Inbox::new(),
            messages: Inbox::new(),
            writing: AtomicBool::new(false),
            instrumentation,
        })
    }

    /// The token this manager is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Enqueue a resolve control event. Callable from any thread; the
    /// listener receives an error immediately if the manager is shutting
    /// down.
    pub fn resolve(&self, locator: Locator, listener: Box<dyn ResolveListener>) {
        match self.events.try_enqueue(ControlEvent::Resolve { locator, listener }) {
            Ok(_) => {
                self.instrumentation.record(Stage::EndpointEnqueue);
                self.request_writing();
            }
            Err(ControlEvent::Resolve { listener, .. }) => {
                listener.on_resolved(Err(NetError::ShuttingDown));
            }
            Err(_) => {}
        }
    }

    /// Enqueue an outbound message. Callable from any thread. On the empty
    /// to non-empty transition the multiplexer is asked for the write mask.
    pub fn enqueue_message(&self, msg: OutboundMessage) -> NetResult<()> {
        match self.messages.try_enqueue(msg) {
            Ok(_) => {
                self.instrumentation.record(Stage::EndpointEnqueue);
                self.request_writing();
                Ok(())
            }
            Err(_) => Err(NetError::ShuttingDown),
        }
    }

    /// Arm a timeout; a [`ControlEvent::Timeout`] is posted to this manager
    /// when the deadline passes. Returns the timer id.
    pub fn set_timeout(&self, deadline: Instant, tag: TimeoutTag) -> u64 {
        self.mpx.set_timeout(self.token, deadline, tag)
    }

    /// Suppress delivery of a previously armed timeout.
    pub fn cancel_timeout(&self, tag: TimeoutTag, id: u64) {
        self.mpx.cancel_timeout(tag, id)
    }

    /// Number of queued outbound messages.
    pub fn queued_messages(&self) -> usize {
        self.messages.len()
    }

    /// Whether the inboxes refuse new work.
    pub fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }

    fn request_writing(&self) {
        if !self.writing.swap(true, Ordering::AcqRel) {
            self.mpx.mask_add(self.token, Interest::WRITABLE);
        }
    }

    /// Close both inboxes; resolve listeners in the backlog get `reason`.
    pub(crate) fn shutdown_queues(&self, reason: &NetError) {
        for event in self.events.close() {
            if let ControlEvent::Resolve { listener, .. } = event {
                listener.on_resolved(Err(reason.clone()));
            }
        }
        let dropped = self.messages.close().len();
        if dropped > 0 {
            debug!(dropped, %reason, "dropped queued outbound messages");
        }
    }
}

/// The multiplexer-thread half of an endpoint manager.
pub struct EndpointDriver<T> {
    shared: Arc<EndpointManager>,
    transport: T,
    arbiter: DrrArbiter,
    dead: bool,
}

impl<T: Transport> EndpointDriver<T> {
    /// Couple a transport to its shared manager half.
    pub fn new(shared: Arc<EndpointManager>, transport: T) -> Self {
        EndpointDriver {
            shared,
            transport,
            arbiter: DrrArbiter::default(),
            dead: false,
        }
    }

    /// Run the application handshake. Must be called before registration
    /// with the multiplexer.
    pub fn init(&mut self) -> NetResult<()> {
        self.transport.init()
    }

    /// The interest set to register with: reads always, writes when the
    /// handshake already queued bytes.
    pub fn initial_interest(&self) -> Interest {
        if self.transport.has_pending() {
            self.shared.writing.store(true, Ordering::Release);
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// The shared manager half.
    pub fn manager(&self) -> &Arc<EndpointManager> {
        &self.shared
    }

    /// Access the transport (test support).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn teardown(&mut self, err: &NetError) {
        if !self.dead {
            self.dead = true;
            self.shared.shutdown_queues(err);
        }
    }

    /// Drain both inboxes into the transport under deficit round-robin,
    /// flushing the wire when the transport queue passes the watermark.
    /// Returns `Err` on fatal transport errors, otherwise whether anything
    /// remains queued.
    fn drain_queues(&mut self) -> NetResult<bool> {
        loop {
            self.arbiter.new_round();
            let mut blocked = false;
            while let Some(event) = self.arbiter.take_control(&self.shared.events) {
                self.shared.instrumentation.record(Stage::EndpointDequeue);
                match event {
                    ControlEvent::Resolve { locator, listener } => {
                        self.transport.resolve(locator, listener)
                    }
                    ControlEvent::Timeout { tag, id } => self.transport.timeout(tag, id),
                }
            }
            while let Some(msg) = self.arbiter.take_message(&self.shared.messages) {
                self.shared.instrumentation.record(Stage::EndpointDequeue);
                self.transport.write_message(msg)?;
                if self.transport.pending_bytes() >= HIGH_WATERMARK {
                    if self.transport.write_some()? {
                        blocked = true;
                        break;
                    }
                }
            }
            if blocked {
                return Ok(true);
            }
            if self.shared.events.is_empty() && self.shared.messages.is_empty() {
                return Ok(false);
            }
        }
    }
}

impl<T: Transport> SocketManager for EndpointDriver<T> {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        self.transport.source()
    }

    fn handle_read_event(&mut self, ctx: &mut MpxContext) -> bool {
        if self.dead {
            return false;
        }
        match self.transport.handle_read_event() {
            Ok(()) => {
                if self.transport.has_pending() {
                    self.shared.writing.store(true, Ordering::Release);
                    ctx.register_writing();
                }
                true
            }
            Err(err) => {
                if err.is_clean_close() {
                    debug!(token = self.shared.token.0, "peer disconnected");
                } else {
                    warn!(token = self.shared.token.0, %err, "read failed");
                }
                self.teardown(&err);
                false
            }
        }
    }

    fn handle_write_event(&mut self, ctx: &mut MpxContext) -> bool {
        if self.dead {
            return false;
        }
        let result = self
            .transport
            .write_some()
            .and_then(|_| self.drain_queues())
            .and_then(|queued| Ok(queued | self.transport.write_some()?));
        match result {
            Ok(true) => true,
            Ok(false) => {
                self.shared.writing.store(false, Ordering::Release);
                // An enqueue may have slipped in between the drain and the
                // flag store; it saw `writing == true` and skipped its
                // wakeup, so take the mask back ourselves.
                if !self.shared.events.is_empty() || !self.shared.messages.is_empty() {
                    self.shared.writing.store(true, Ordering::Release);
                    ctx.register_writing();
                    return true;
                }
                trace!(token = self.shared.token.0, "write queue drained");
                false
            }
            Err(err) => {
                warn!(token = self.shared.token.0, %err, "write failed");
                self.teardown(&err);
                false
            }
        }
    }

    fn handle_timeout(&mut self, ctx: &mut MpxContext, tag: TimeoutTag, id: u64) {
        if self.dead {
            return;
        }
        if self
            .shared
            .events
            .try_enqueue(ControlEvent::Timeout { tag, id })
            .is_ok()
        {
            self.shared.writing.store(true, Ordering::Release);
            ctx.register_writing();
        }
    }

    fn handle_error(&mut self, err: NetError) {
        self.transport.handle_error(err.clone());
        self.teardown(&err);
    }

    fn abort(&mut self, reason: &NetError) {
        self.transport.handle_error(reason.clone());
        self.teardown(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::Multiplexer;
    use crate::socket::stream_socket_pair;

    enum Seen {
        Resolve,
        Message(usize),
    }

    /// Transport double recording the order the driver hands work over.
    struct RecordingTransport {
        socket: mio::net::UnixStream,
        seen: Vec<Seen>,
    }

    impl Transport for RecordingTransport {
        fn source(&mut self) -> &mut dyn mio::event::Source {
            &mut self.socket
        }

        fn init(&mut self) -> NetResult<()> {
            Ok(())
        }

        fn handle_read_event(&mut self) -> NetResult<()> {
            Ok(())
        }

        fn write_message(&mut self, msg: OutboundMessage) -> NetResult<()> {
            let size = msg.task_size();
            self.seen.push(Seen::Message(size));
            Ok(())
        }

        fn resolve(&mut self, _locator: Locator, listener: Box<dyn ResolveListener>) {
            self.seen.push(Seen::Resolve);
            listener.on_resolved(Err(NetError::timeout("test")));
        }

        fn timeout(&mut self, _tag: TimeoutTag, _id: u64) {}

        fn write_some(&mut self) -> NetResult<bool> {
            Ok(false)
        }

        fn pending_bytes(&self) -> usize {
            0
        }

        fn handle_error(&mut self, _err: NetError) {}
    }

    fn fixture() -> (
        EndpointDriver<RecordingTransport>,
        Arc<EndpointManager>,
        mio::net::UnixStream,
    ) {
        let mpx = Multiplexer::new().expect("multiplexer");
        let handle = mpx.handle();
        let token = handle.allocate_token();
        let shared = EndpointManager::new(handle, token, Arc::new(Instrumentation::new()));
        let (local, remote) = stream_socket_pair().expect("pair");
        let driver = EndpointDriver::new(
            Arc::clone(&shared),
            RecordingTransport {
                socket: local,
                seen: Vec::new(),
            },
        );
        (driver, shared, remote)
    }

    fn node() -> NodeId {
        NodeId::from_origin("test://peer:1")
    }

    #[test]
    fn resolve_is_not_starved_by_message_flood() {
        let (mut driver, shared, _remote) = fixture();
        for _ in 0..1000 {
            shared
                .enqueue_message(OutboundMessage {
                    peer: node(),
                    item: OutboundItem::Message {
                        sender: ActorId(1),
                        receiver: ActorId(2),
                        payload: Bytes::from(vec![0u8; 1024]),
                    },
                })
                .expect("enqueue");
        }
        let (listener, _) = crate::proxy::BlockingResolve::pair();
        shared.resolve("test://peer:1/srv".parse().expect("locator"), listener);

        let mut ctx = MpxContext::new(shared.token());
        assert!(!driver.handle_write_event(&mut ctx));

        let position = driver
            .transport
            .seen
            .iter()
            .position(|s| matches!(s, Seen::Resolve))
            .expect("resolve processed");
        // Deficit round-robin: the single control event must surface within
        // the first round, far ahead of the thousand queued messages.
        assert!(position < 8, "resolve drained at position {position}");
        let drained: usize = driver
            .transport
            .seen
            .iter()
            .filter_map(|s| match s {
                Seen::Message(size) => Some(*size),
                Seen::Resolve => None,
            })
            .count();
        assert_eq!(drained, 1000);
    }

    #[test]
    fn drained_queues_clear_the_write_flag() {
        let (mut driver, shared, _remote) = fixture();
        shared
            .enqueue_message(OutboundMessage {
                peer: node(),
                item: OutboundItem::Message {
                    sender: ActorId(1),
                    receiver: ActorId(2),
                    payload: Bytes::from_static(b"x"),
                },
            })
            .expect("enqueue");
        assert!(shared.writing.load(Ordering::Acquire));

        let mut ctx = MpxContext::new(shared.token());
        assert!(!driver.handle_write_event(&mut ctx));
        assert!(!shared.writing.load(Ordering::Acquire));
    }

    #[test]
    fn shutdown_fails_queued_listeners() {
        let (mut driver, shared, _remote) = fixture();
        let (listener, pending) = crate::proxy::BlockingResolve::pair();
        shared.resolve("test://peer:1/srv".parse().expect("locator"), listener);
        driver.abort(&NetError::ShuttingDown);
        let err = pending
            .wait(std::time::Duration::from_millis(100))
            .expect_err("failed listener");
        assert_eq!(err, NetError::ShuttingDown);
        assert!(shared.enqueue_message(OutboundMessage {
            peer: node(),
            item: OutboundItem::Monitor { receiver: ActorId(9) },
        }).is_err());
    }
}
