//! Test backend: socket pairs instead of kernel networking.

use std::collections::HashMap;
use std::sync::Arc;

use mio::net::UnixStream;
use tracing::debug;
use weft_core::{ActorId, Locator, NetError, NetResult, NodeId};

use crate::backend::{spawn_stream_endpoint, Backend, BackendEnv};
use crate::endpoint::EndpointManager;
use crate::proxy::{ProxyRegistry, RemoteActorRef, ResolveListener};
use crate::socket::stream_socket_pair;

/// Backend for the `test` scheme.
///
/// Peers are emplaced explicitly: [`emplace`] builds a connected socket
/// pair, runs an endpoint manager over one end, and hands the other end
/// back — typically to a second module's test backend, wiring two in-process
/// nodes together without touching the kernel's network stack.
///
/// [`emplace`]: TestBackend::emplace
pub struct TestBackend {
    env: BackendEnv,
    proxies: Arc<ProxyRegistry>,
    peers: HashMap<NodeId, Arc<EndpointManager>>,
}

impl TestBackend {
    /// An empty test backend.
    pub fn new(env: BackendEnv) -> Self {
        TestBackend {
            env,
            proxies: Arc::new(ProxyRegistry::new()),
            peers: HashMap::new(),
        }
    }

    /// Create a socket pair, serve `peer` over one end, and return the
    /// other end for the caller to wire up.
    pub fn emplace(&mut self, peer: NodeId) -> NetResult<UnixStream> {
        let (ours, theirs) = stream_socket_pair()?;
        self.emplace_with(peer, ours)?;
        Ok(theirs)
    }

    /// Serve `peer` over an existing socket (usually the far end of another
    /// backend's [`emplace`](TestBackend::emplace)).
    pub fn emplace_with(&mut self, peer: NodeId, socket: UnixStream) -> NetResult<Arc<EndpointManager>> {
        debug!(%peer, "emplacing test peer");
        let manager = spawn_stream_endpoint(&self.env, &self.proxies, socket)?;
        self.peers.insert(peer, Arc::clone(&manager));
        Ok(manager)
    }

    /// The endpoint manager serving `peer`, if emplaced.
    pub fn peer(&self, node: &NodeId) -> Option<&Arc<EndpointManager>> {
        self.peers.get(node)
    }

    /// This backend's proxy registry.
    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }
}

impl Backend for TestBackend {
    fn scheme(&self) -> &'static str {
        "test"
    }

    fn init(&mut self) -> NetResult<()> {
        Ok(())
    }

    fn stop(&mut self) {
        for (_, manager) in self.peers.drain() {
            self.env.mpx.close(manager.token());
        }
    }

    fn connect(&mut self, locator: &Locator) -> NetResult<Arc<EndpointManager>> {
        self.peers
            .get(&locator.node_id())
            .cloned()
            .ok_or_else(|| NetError::runtime(format!("no test peer emplaced for {locator}")))
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        match self.connect(&locator) {
            Ok(manager) => manager.resolve(locator, listener),
            Err(err) => listener.on_resolved(Err(err)),
        }
    }

    fn make_proxy(&mut self, node: NodeId, id: ActorId) -> NetResult<Arc<RemoteActorRef>> {
        let manager = self
            .peers
            .get(&node)
            .cloned()
            .ok_or_else(|| NetError::runtime(format!("no test peer emplaced for {node}")))?;
        Ok(self.proxies.get_or_make(node, id, &manager))
    }

    fn port(&self) -> Option<u16> {
        None
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
