//! UDP backend: one datagram endpoint manager for every peer.

use std::sync::Arc;

use tracing::info;
use weft_core::{ActorId, Locator, NetError, NetResult, NodeId};

use crate::backend::{Backend, BackendEnv};
use crate::basp::BaspFactory;
use crate::endpoint::{EndpointDriver, EndpointManager};
use crate::proxy::{ProxyRegistry, RemoteActorRef, ResolveListener};
use crate::socket::bind_udp;
use crate::transport::{DatagramTransport, TimerHandle};

/// Backend for the `udp` scheme.
///
/// One socket, one endpoint manager; the datagram transport's worker
/// dispatcher separates peers below it. `connect` therefore returns the
/// shared manager — actual peer dialing happens on the multiplexer thread
/// when a resolve carrying the peer's locator reaches the transport.
pub struct UdpBackend {
    env: BackendEnv,
    proxies: Arc<ProxyRegistry>,
    manager: Option<Arc<EndpointManager>>,
    port: Option<u16>,
}

impl UdpBackend {
    /// A backend that will bind `cfg.udp_port` on init.
    pub fn new(env: BackendEnv) -> Self {
        UdpBackend {
            env,
            proxies: Arc::new(ProxyRegistry::new()),
            manager: None,
            port: None,
        }
    }

    /// This backend's proxy registry.
    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    fn shared_manager(&self) -> NetResult<Arc<EndpointManager>> {
        self.manager
            .clone()
            .ok_or_else(|| NetError::runtime("udp backend is not initialized"))
    }
}

impl Backend for UdpBackend {
    fn scheme(&self) -> &'static str {
        "udp"
    }

    fn init(&mut self) -> NetResult<()> {
        let socket = bind_udp(self.env.cfg.udp_port)?;
        let addr = socket.local_addr().map_err(NetError::from)?;
        self.port = Some(addr.port());
        info!(port = addr.port(), "udp backend bound");

        let token = self.env.mpx.allocate_token();
        let manager = EndpointManager::new(
            self.env.mpx.clone(),
            token,
            Arc::clone(&self.env.instrumentation),
        );
        let factory = BaspFactory::new(
            self.env.basp_config(self.env.cfg.enable_ordering),
            Arc::clone(&self.env.host),
            Arc::clone(&self.proxies),
            Arc::clone(&manager),
        );
        let transport = DatagramTransport::new(
            socket,
            factory,
            TimerHandle::new(self.env.mpx.clone(), token),
            self.env.cfg.max_header_buffers,
            self.env.cfg.max_payload_buffers,
        );
        let mut driver = EndpointDriver::new(Arc::clone(&manager), transport);
        driver.init()?;
        let interest = driver.initial_interest();
        self.env.mpx.register(Box::new(driver), token, interest)?;
        self.manager = Some(manager);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.env.mpx.close(manager.token());
        }
    }

    fn connect(&mut self, _locator: &Locator) -> NetResult<Arc<EndpointManager>> {
        self.shared_manager()
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        match self.shared_manager() {
            Ok(manager) => manager.resolve(locator, listener),
            Err(err) => listener.on_resolved(Err(err)),
        }
    }

    fn make_proxy(&mut self, node: NodeId, id: ActorId) -> NetResult<Arc<RemoteActorRef>> {
        let manager = self.shared_manager()?;
        Ok(self.proxies.get_or_make(node, id, &manager))
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
