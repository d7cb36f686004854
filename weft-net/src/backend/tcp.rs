//! TCP backend: one stream endpoint manager per peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mio::net::TcpListener;
use mio::Interest;
use tracing::{debug, error, info, warn};
use weft_core::{ActorId, Locator, NetError, NetResult, NodeId};

use crate::backend::{spawn_stream_endpoint, Backend, BackendEnv};
use crate::endpoint::EndpointManager;
use crate::multiplexer::{MpxContext, SocketManager};
use crate::proxy::{ProxyRegistry, RemoteActorRef, ResolveListener};
use crate::socket::{bind_tcp_listener, dial_tcp};

type PeerTable = Arc<Mutex<HashMap<NodeId, Arc<EndpointManager>>>>;

/// Backend for the `tcp` scheme.
///
/// Dialed peers are keyed by node id; accepted connections identify
/// themselves during the handshake and are owned here anonymously until
/// then.
pub struct TcpBackend {
    env: BackendEnv,
    proxies: Arc<ProxyRegistry>,
    peers: PeerTable,
    accepted: Arc<Mutex<Vec<Arc<EndpointManager>>>>,
    port: Option<u16>,
}

impl TcpBackend {
    /// A backend that will bind `cfg.tcp_port` on init.
    pub fn new(env: BackendEnv) -> Self {
        TcpBackend {
            env,
            proxies: Arc::new(ProxyRegistry::new()),
            peers: Arc::new(Mutex::new(HashMap::new())),
            accepted: Arc::new(Mutex::new(Vec::new())),
            port: None,
        }
    }

    /// This backend's proxy registry.
    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    fn peer(&self, node: &NodeId) -> Option<Arc<EndpointManager>> {
        lock(&self.peers).get(node).cloned()
    }
}

impl Backend for TcpBackend {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn init(&mut self) -> NetResult<()> {
        let listener = bind_tcp_listener(self.env.cfg.tcp_port)?;
        let addr = listener.local_addr().map_err(NetError::from)?;
        self.port = Some(addr.port());
        info!(port = addr.port(), "tcp backend listening");
        let token = self.env.mpx.allocate_token();
        let manager = TcpListenerManager {
            listener,
            env: self.env.clone(),
            proxies: Arc::clone(&self.proxies),
            accepted: Arc::clone(&self.accepted),
        };
        self.env
            .mpx
            .register(Box::new(manager), token, Interest::READABLE)
    }

    fn stop(&mut self) {
        for (_, manager) in lock(&self.peers).drain() {
            self.env.mpx.close(manager.token());
        }
        for manager in lock_accepted(&self.accepted).drain(..) {
            self.env.mpx.close(manager.token());
        }
    }

    fn connect(&mut self, locator: &Locator) -> NetResult<Arc<EndpointManager>> {
        let node = locator.node_id();
        if let Some(existing) = self.peer(&node) {
            if !existing.is_closed() {
                return Ok(existing);
            }
            lock(&self.peers).remove(&node);
        }
        debug!(peer = %node, "dialing");
        let socket = dial_tcp(locator.host(), locator.port())?;
        let manager = spawn_stream_endpoint(&self.env, &self.proxies, socket)?;
        lock(&self.peers).insert(node, Arc::clone(&manager));
        Ok(manager)
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        match self.connect(&locator) {
            Ok(manager) => manager.resolve(locator, listener),
            Err(err) => listener.on_resolved(Err(err)),
        }
    }

    fn make_proxy(&mut self, node: NodeId, id: ActorId) -> NetResult<Arc<RemoteActorRef>> {
        let manager = self
            .peer(&node)
            .ok_or_else(|| NetError::runtime(format!("not connected to {node}")))?;
        Ok(self.proxies.get_or_make(node, id, &manager))
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Socket manager accepting inbound connections.
struct TcpListenerManager {
    listener: TcpListener,
    env: BackendEnv,
    proxies: Arc<ProxyRegistry>,
    accepted: Arc<Mutex<Vec<Arc<EndpointManager>>>>,
}

impl SocketManager for TcpListenerManager {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.listener
    }

    fn handle_read_event(&mut self, _ctx: &mut MpxContext) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%peer, ?err, "set_nodelay failed");
                    }
                    match spawn_stream_endpoint(&self.env, &self.proxies, stream) {
                        Ok(manager) => lock_accepted(&self.accepted).push(manager),
                        Err(err) => warn!(%peer, %err, "endpoint setup failed"),
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(?err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    error!(?err, "accept failed, closing listener");
                    return false;
                }
            }
        }
    }

    fn handle_write_event(&mut self, _ctx: &mut MpxContext) -> bool {
        false
    }

    fn handle_error(&mut self, err: NetError) {
        error!(%err, "listener error");
    }

    fn abort(&mut self, _reason: &NetError) {
        // Accepted endpoint managers are aborted individually by the
        // multiplexer drain.
    }
}

fn lock(peers: &Mutex<HashMap<NodeId, Arc<EndpointManager>>>)
    -> std::sync::MutexGuard<'_, HashMap<NodeId, Arc<EndpointManager>>> {
    match peers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_accepted(
    accepted: &Mutex<Vec<Arc<EndpointManager>>>,
) -> std::sync::MutexGuard<'_, Vec<Arc<EndpointManager>>> {
    match accepted.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
