//! Backends and the network module owning them.
//!
//! One backend per URI scheme: it binds the scheme's listening sockets,
//! dials peers, and is the single owner of the endpoint managers serving
//! them. The [`NetworkModule`] ties everything together — the multiplexer,
//! the backends, and (unless configured for manual multiplexing) the
//! dedicated multiplexer thread.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use weft_core::{ActorHost, ActorId, Locator, NetError, NetResult, NodeId};

use crate::basp::{BaspApplication, BaspConfig};
use crate::config::NetConfig;
use crate::endpoint::{EndpointDriver, EndpointManager};
use crate::instrument::Instrumentation;
use crate::multiplexer::{Multiplexer, MultiplexerHandle};
use crate::proxy::{BlockingResolve, ProxyRegistry, RemoteActorRef, ResolveListener};
use crate::transport::{StreamTransport, TimerHandle};

pub mod quic;
pub mod tcp;
pub mod test;
pub mod udp;

pub use quic::QuicBackend;
pub use tcp::TcpBackend;
pub use test::TestBackend;
pub use udp::UdpBackend;

/// Everything a backend needs from its owning module.
#[derive(Clone)]
pub struct BackendEnv {
    /// Handle to the module's multiplexer.
    pub mpx: MultiplexerHandle,
    /// The module configuration.
    pub cfg: Arc<NetConfig>,
    /// The hosting actor runtime.
    pub host: Arc<dyn ActorHost>,
    /// Shared latency instrumentation sink.
    pub instrumentation: Arc<Instrumentation>,
}

impl BackendEnv {
    /// The BASP configuration for a connection of this module.
    pub fn basp_config(&self, ordering: bool) -> BaspConfig {
        BaspConfig {
            node: self.cfg.this_node.node_id(),
            ordering,
            heartbeat_interval: self.cfg.heartbeat_interval,
        }
    }
}

/// Per-scheme connection management.
///
/// Backends run on whatever thread calls into the module; everything they
/// hand to the multiplexer goes through [`MultiplexerHandle`] operations.
pub trait Backend: Send {
    /// The URI scheme this backend claims.
    fn scheme(&self) -> &'static str;

    /// Bind listening sockets. Errors here are fatal to the backend and
    /// surface from [`NetworkModule::start`].
    fn init(&mut self) -> NetResult<()>;

    /// Release every endpoint manager this backend owns.
    fn stop(&mut self);

    /// Dial (or reuse) the endpoint manager for a peer.
    fn connect(&mut self, locator: &Locator) -> NetResult<Arc<EndpointManager>>;

    /// Route a resolve to the peer the locator names.
    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>);

    /// Construct a proxy for an actor on an already-known peer.
    fn make_proxy(&mut self, node: NodeId, id: ActorId) -> NetResult<Arc<RemoteActorRef>>;

    /// The bound listening port, once `init` ran.
    fn port(&self) -> Option<u16>;

    /// Concrete-type access for callers that know their backend.
    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

/// Build, handshake, and register a stream endpoint over `socket`.
///
/// Shared by the tcp backend (dial and accept paths) and the test backend.
pub(crate) fn spawn_stream_endpoint<S>(
    env: &BackendEnv,
    proxies: &Arc<ProxyRegistry>,
    socket: S,
) -> NetResult<Arc<EndpointManager>>
where
    S: std::io::Read + std::io::Write + mio::event::Source + Send + 'static,
{
    let token = env.mpx.allocate_token();
    let manager = EndpointManager::new(
        env.mpx.clone(),
        token,
        Arc::clone(&env.instrumentation),
    );
    let app = BaspApplication::new(
        env.basp_config(false),
        Arc::clone(&env.host),
        Arc::clone(proxies),
        Arc::clone(&manager),
    );
    let transport = StreamTransport::new(
        socket,
        app,
        TimerHandle::new(env.mpx.clone(), token),
        env.cfg.max_header_buffers,
        env.cfg.max_payload_buffers,
    );
    let mut driver = EndpointDriver::new(Arc::clone(&manager), transport);
    driver.init()?;
    let interest = driver.initial_interest();
    env.mpx.register(Box::new(driver), token, interest)?;
    Ok(manager)
}

/// The network module: owns the multiplexer, the backends, and the
/// multiplexer thread.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use weft_net::{NetConfig, NetworkModule};
/// # use weft_core::{ActorHost, ActorId, Envelope};
/// # struct Host;
/// # impl ActorHost for Host {
/// #     fn deliver(&self, _env: Envelope) {}
/// #     fn lookup(&self, _path: &str) -> Option<ActorId> { None }
/// # }
///
/// let cfg = NetConfig::new("tcp://worker-1:0".parse().expect("locator"));
/// let mut module = NetworkModule::new(cfg, Arc::new(Host))
///     .expect("module")
///     .with_tcp()
///     .with_udp();
/// module.start().expect("start");
/// let proxy = module
///     .resolve_sync(
///         &"tcp://worker-2:4001/ledger".parse().expect("locator"),
///         std::time::Duration::from_secs(5),
///     )
///     .expect("resolve");
/// proxy.tell(ActorId::INVALID, bytes::Bytes::from_static(b"hi")).expect("tell");
/// module.stop();
/// ```
pub struct NetworkModule {
    mpx: Option<Multiplexer>,
    handle: MultiplexerHandle,
    backends: Vec<Box<dyn Backend>>,
    thread: Option<std::thread::JoinHandle<()>>,
    env: BackendEnv,
}

impl NetworkModule {
    /// A module with no backends; add them with the `with_*` builders
    /// before calling [`start`](NetworkModule::start).
    pub fn new(cfg: NetConfig, host: Arc<dyn ActorHost>) -> NetResult<Self> {
        let mpx = Multiplexer::new()?;
        let handle = mpx.handle();
        let env = BackendEnv {
            mpx: handle.clone(),
            cfg: Arc::new(cfg),
            host,
            instrumentation: Arc::new(Instrumentation::new()),
        };
        Ok(NetworkModule {
            mpx: Some(mpx),
            handle,
            backends: Vec::new(),
            thread: None,
            env,
        })
    }

    /// Add the TCP backend.
    pub fn with_tcp(mut self) -> Self {
        let backend = TcpBackend::new(self.env.clone());
        self.backends.push(Box::new(backend));
        self
    }

    /// Add the UDP backend.
    pub fn with_udp(mut self) -> Self {
        let backend = UdpBackend::new(self.env.clone());
        self.backends.push(Box::new(backend));
        self
    }

    /// Add the test backend (socket pairs instead of kernel sockets).
    pub fn with_test(mut self) -> Self {
        let backend = TestBackend::new(self.env.clone());
        self.backends.push(Box::new(backend));
        self
    }

    /// Add a caller-constructed backend (e.g. [`QuicBackend`]).
    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// The environment handed to backends; use it to construct custom ones.
    pub fn env(&self) -> &BackendEnv {
        &self.env
    }

    /// The node id this module announces to peers.
    pub fn this_node(&self) -> NodeId {
        self.env.cfg.this_node.node_id()
    }

    /// Handle to the multiplexer.
    pub fn handle(&self) -> &MultiplexerHandle {
        &self.handle
    }

    /// The module's instrumentation sink.
    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.env.instrumentation
    }

    /// Initialize every backend, then spawn the multiplexer thread (unless
    /// `manual_multiplexing` is set).
    pub fn start(&mut self) -> NetResult<()> {
        for backend in &mut self.backends {
            backend.init().map_err(|err| {
                error!(scheme = backend.scheme(), %err, "backend init failed");
                err
            })?;
            debug!(scheme = backend.scheme(), port = ?backend.port(), "backend up");
        }
        if !self.env.cfg.manual_multiplexing {
            let mut mpx = self
                .mpx
                .take()
                .ok_or_else(|| NetError::runtime("module already started"))?;
            let thread = std::thread::Builder::new()
                .name("weft.multiplexer".to_string())
                .spawn(move || mpx.run())
                .map_err(NetError::from)?;
            self.thread = Some(thread);
        }
        info!(node = %self.this_node(), "network module started");
        Ok(())
    }

    /// Stop every backend, shut the multiplexer down, and join its thread.
    /// With manual multiplexing the loop runs here, on the caller, until
    /// the drain completes.
    pub fn stop(&mut self) {
        for backend in &mut self.backends {
            backend.stop();
        }
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        } else if let Some(mut mpx) = self.mpx.take() {
            mpx.run();
        }
        info!(node = %self.this_node(), "network module stopped");
    }

    /// The multiplexer, while the module runs in manual mode. Drive it
    /// with [`Multiplexer::poll_once`] or [`Multiplexer::run`].
    pub fn multiplexer_mut(&mut self) -> Option<&mut Multiplexer> {
        self.mpx.as_mut()
    }

    /// Dial (or reuse) the endpoint manager for `locator`'s peer.
    pub fn connect(&mut self, locator: &Locator) -> NetResult<Arc<EndpointManager>> {
        let scheme = locator.scheme().to_string();
        self.backend_mut(&scheme)
            .ok_or(NetError::InvalidScheme { scheme })?
            .connect(locator)
    }

    /// Resolve the actor `locator` names; the listener gets the proxy or an
    /// error.
    pub fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        let scheme = locator.scheme().to_string();
        match self.backend_mut(&scheme) {
            Some(backend) => backend.resolve(locator, listener),
            None => listener.on_resolved(Err(NetError::InvalidScheme { scheme })),
        }
    }

    /// Resolve and block until the proxy arrives or `timeout` passes.
    pub fn resolve_sync(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> NetResult<Arc<RemoteActorRef>> {
        let (listener, pending) = BlockingResolve::pair();
        self.resolve(locator.clone(), listener);
        pending.wait(timeout)
    }

    /// Construct a proxy for an actor on a peer the scheme's backend
    /// already knows.
    pub fn make_proxy(
        &mut self,
        scheme: &str,
        node: NodeId,
        id: ActorId,
    ) -> NetResult<Arc<RemoteActorRef>> {
        self.backend_mut(scheme)
            .ok_or_else(|| NetError::InvalidScheme {
                scheme: scheme.to_string(),
            })?
            .make_proxy(node, id)
    }

    /// The listening port bound for `scheme`.
    pub fn port(&self, scheme: &str) -> NetResult<u16> {
        self.backends
            .iter()
            .find(|b| b.scheme() == scheme)
            .ok_or_else(|| NetError::InvalidScheme {
                scheme: scheme.to_string(),
            })?
            .port()
            .ok_or_else(|| NetError::runtime(format!("{scheme} backend is not bound")))
    }

    /// Mutable access to the backend for `scheme`.
    pub fn backend_mut(&mut self, scheme: &str) -> Option<&mut (dyn Backend + '_)> {
        for backend in self.backends.iter_mut() {
            if backend.scheme() == scheme {
                return Some(backend.as_mut());
            }
        }
        None
    }
}

impl Drop for NetworkModule {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}
