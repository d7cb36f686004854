//! QUIC backend: a datagram socket demultiplexed by connection id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use weft_core::{ActorId, Locator, NetError, NetResult, NodeId};

use crate::backend::{Backend, BackendEnv};
use crate::basp::BaspFactory;
use crate::endpoint::{EndpointDriver, EndpointManager};
use crate::proxy::{ProxyRegistry, RemoteActorRef, ResolveListener};
use crate::socket::bind_udp;
use crate::transport::{QuicStack, QuicTransport, TimerHandle};

/// Backend for the `quic` scheme.
///
/// The QUIC implementation itself is supplied by the embedder as a
/// [`QuicStack`] factory; this backend resolves the certificate directory
/// from configuration (there is no compiled-in fallback), builds the stack
/// at init time, and runs one endpoint manager over one UDP socket.
pub struct QuicBackend<Q, F> {
    env: BackendEnv,
    proxies: Arc<ProxyRegistry>,
    make_stack: Option<F>,
    manager: Option<Arc<EndpointManager>>,
    listen_port: u16,
    port: Option<u16>,
    _stack: std::marker::PhantomData<fn() -> Q>,
}

impl<Q, F> QuicBackend<Q, F>
where
    Q: QuicStack + 'static,
    F: FnOnce(&Path) -> NetResult<Q> + Send + 'static,
{
    /// A backend binding `listen_port` (0 = ephemeral) on init. The stack
    /// factory receives the resolved certificate directory.
    pub fn new(env: BackendEnv, listen_port: u16, make_stack: F) -> Self {
        QuicBackend {
            env,
            proxies: Arc::new(ProxyRegistry::new()),
            make_stack: Some(make_stack),
            manager: None,
            listen_port,
            port: None,
            _stack: std::marker::PhantomData,
        }
    }

    /// This backend's proxy registry.
    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    fn shared_manager(&self) -> NetResult<Arc<EndpointManager>> {
        self.manager
            .clone()
            .ok_or_else(|| NetError::runtime("quic backend is not initialized"))
    }
}

impl<Q, F> Backend for QuicBackend<Q, F>
where
    Q: QuicStack + 'static,
    F: FnOnce(&Path) -> NetResult<Q> + Send + 'static,
{
    fn scheme(&self) -> &'static str {
        "quic"
    }

    fn init(&mut self) -> NetResult<()> {
        let certificates: PathBuf = self.env.cfg.quic_certificate_dir()?;
        let make_stack = self
            .make_stack
            .take()
            .ok_or_else(|| NetError::runtime("quic backend already initialized"))?;
        let stack = make_stack(&certificates)?;

        let socket = bind_udp(self.listen_port)?;
        let addr = socket.local_addr().map_err(NetError::from)?;
        self.port = Some(addr.port());
        info!(port = addr.port(), "quic backend bound");

        let token = self.env.mpx.allocate_token();
        let manager = EndpointManager::new(
            self.env.mpx.clone(),
            token,
            Arc::clone(&self.env.instrumentation),
        );
        let factory = BaspFactory::new(
            self.env.basp_config(false),
            Arc::clone(&self.env.host),
            Arc::clone(&self.proxies),
            Arc::clone(&manager),
        );
        let transport = QuicTransport::new(
            socket,
            stack,
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
