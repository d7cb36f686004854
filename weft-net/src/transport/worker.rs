//! Per-peer application workers for demultiplexing transports.
//!
//! Datagram and QUIC transports serve many peers over one socket. Each peer
//! gets a [`TransportWorker`] — an application instance tagged with the
//! peer's endpoint id — and a [`WorkerDispatcher`] routes inbound data and
//! outbound messages to the right worker.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::{debug, trace};
use weft_core::{Locator, NetError, NetResult, NodeId};

use crate::endpoint::OutboundMessage;
use crate::multiplexer::TimeoutTag;
use crate::proxy::ResolveListener;
use crate::transport::{Application, ApplicationFactory, PacketWriter};

/// One application instance bound to one remote endpoint id.
pub struct TransportWorker<A, Id> {
    id: Id,
    app: A,
}

impl<A: Application, Id: Clone> TransportWorker<A, Id> {
    /// Wrap an application for the peer identified by `id`.
    pub fn new(app: A, id: Id) -> Self {
        TransportWorker { id, app }
    }

    /// The remote endpoint id this worker serves.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The wrapped application.
    pub fn application(&self) -> &A {
        &self.app
    }

    /// Run the application handshake.
    pub fn init(&mut self, writer: &mut dyn PacketWriter) -> NetResult<()> {
        self.app.init(writer)
    }

    /// Feed one inbound chunk to the application.
    pub fn handle_data(&mut self, writer: &mut dyn PacketWriter, data: &[u8]) -> NetResult<()> {
        self.app.handle_data(writer, data)
    }

    /// Frame one outbound message.
    pub fn write_message(
        &mut self,
        writer: &mut dyn PacketWriter,
        msg: OutboundMessage,
    ) -> NetResult<()> {
        self.app.write_message(writer, msg)
    }

    /// Forward a resolve to the application.
    pub fn resolve(
        &mut self,
        writer: &mut dyn PacketWriter,
        locator: Locator,
        listener: Box<dyn ResolveListener>,
    ) {
        self.app.resolve(writer, locator, listener)
    }

    /// Forward a fired timeout to the application.
    pub fn timeout(&mut self, writer: &mut dyn PacketWriter, tag: TimeoutTag, id: u64) {
        self.app.timeout(writer, tag, id)
    }

    /// Report an error to the application.
    pub fn handle_error(&mut self, err: NetError) {
        self.app.handle_error(err)
    }

    /// The peer's node id, once known.
    pub fn peer(&self) -> Option<NodeId> {
        self.app.peer()
    }
}

/// Routes per-peer work for a demultiplexing transport.
///
/// Keyed by the remote endpoint id — the peer address for plain datagram
/// transports, the connection id for QUIC. Node-id routing for outbound
/// messages is learned lazily from the applications once their handshakes
/// complete.
pub struct WorkerDispatcher<F: ApplicationFactory, Id> {
    factory: F,
    workers: HashMap<Id, TransportWorker<F::Application, Id>>,
    by_node: HashMap<NodeId, Id>,
}

impl<F, Id> WorkerDispatcher<F, Id>
where
    F: ApplicationFactory,
    Id: Clone + Eq + Hash + std::fmt::Debug,
{
    /// A dispatcher spawning workers from `factory`.
    pub fn new(factory: F) -> Self {
        WorkerDispatcher {
            factory,
            workers: HashMap::new(),
            by_node: HashMap::new(),
        }
    }

    /// Whether a worker exists for `id`.
    pub fn contains(&self, id: &Id) -> bool {
        self.workers.contains_key(id)
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers exist.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn a worker for a new peer and run its handshake.
    pub fn add_worker(
        &mut self,
        id: Id,
        writer: &mut dyn PacketWriter,
    ) -> NetResult<&mut TransportWorker<F::Application, Id>> {
        debug!(peer = ?id, "spawning transport worker");
        let mut worker = TransportWorker::new(self.factory.make(), id.clone());
        worker.init(writer)?;
        Ok(self.workers.entry(id).or_insert(worker))
    }

    /// The worker for `id`, if any.
    pub fn get_mut(&mut self, id: &Id) -> Option<&mut TransportWorker<F::Application, Id>> {
        self.workers.get_mut(id)
    }

    /// The worker serving `node`, refreshing the node table from completed
    /// handshakes on a miss.
    pub fn worker_for_node(
        &mut self,
        node: &NodeId,
    ) -> Option<&mut TransportWorker<F::Application, Id>> {
        if !self.by_node.contains_key(node) {
            self.refresh_nodes();
        }
        let id = self.by_node.get(node)?.clone();
        self.workers.get_mut(&id)
    }

    /// Remove a worker, failing its pending work with `reason`.
    pub fn remove(&mut self, id: &Id, reason: &NetError) {
        if let Some(mut worker) = self.workers.remove(id) {
            trace!(peer = ?id, %reason, "removing transport worker");
            worker.handle_error(reason.clone());
            self.by_node.retain(|_, worker_id| worker_id != id);
        }
    }

    /// Report a socket-level error to every worker.
    pub fn handle_error(&mut self, err: NetError) {
        for worker in self.workers.values_mut() {
            worker.handle_error(err.clone());
        }
    }

    fn refresh_nodes(&mut self) {
        for (id, worker) in &self.workers {
            if let Some(node) = worker.peer() {
                self.by_node.entry(node).or_insert_with(|| id.clone());
            }
        }
    }
}
