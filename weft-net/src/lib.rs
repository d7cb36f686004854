//! # weft-net
//!
//! The multiplexed endpoint layer of the weft distributed actor runtime.
//!
//! weft connects processes that each host a set of actors: every remote
//! actor gets a local proxy, outgoing messages to those proxies are
//! serialized and shipped over pluggable transports, and inbound frames are
//! re-materialized for the local runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                Actor runtime                      │
//! │      proxies in, envelopes out (ActorHost)        │
//! ├──────────────────────────────────────────────────┤
//! │   NetworkModule / backends (tcp, udp, quic, test) │
//! │   • one backend per URI scheme                    │
//! │   • owns peer endpoint managers                   │
//! ├──────────────────────────────────────────────────┤
//! │   Endpoint manager (per socket)                   │
//! │   • control-event + outbound-message inboxes      │
//! │   • deficit-round-robin drain into the transport  │
//! ├──────────────────────────────────────────────────┤
//! │   Transport → Application (BASP framing)          │
//! │   • stream / datagram / QUIC byte policies        │
//! ├──────────────────────────────────────────────────┤
//! │   Multiplexer (one thread, poll-driven)           │
//! │   • pollset updater wakes it from other threads   │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one thread runs the multiplexer; every transport read, write,
//! and protocol callback happens there. Other threads only ever enqueue
//! into endpoint inboxes (waking the loop through the pollset updater) and
//! receive results through listeners.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_net::{NetConfig, NetworkModule};
//! # struct Host;
//! # impl weft_core::ActorHost for Host {
//! #     fn deliver(&self, _env: weft_core::Envelope) {}
//! #     fn lookup(&self, _path: &str) -> Option<weft_core::ActorId> { None }
//! # }
//!
//! let cfg = NetConfig::new("tcp://node-a:0".parse().expect("locator"));
//! let mut module = NetworkModule::new(cfg, Arc::new(Host))
//!     .expect("module")
//!     .with_tcp();
//! module.start().expect("start");
//! let proxy = module
//!     .resolve_sync(
//!         &"tcp://node-b:4001/srv".parse().expect("locator"),
//!         std::time::Duration::from_secs(5),
//!     )
//!     .expect("resolve");
//! proxy
//!     .tell(weft_core::ActorId(1), bytes::Bytes::from_static(b"payload"))
//!     .expect("send");
//! module.stop();
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Backends and the network module.
pub mod backend;

/// BASP, the default framing application.
pub mod basp;

/// Configuration keys and defaults.
pub mod config;

/// Endpoint managers and their queue types.
pub mod endpoint;

/// Cross-thread inboxes and the DRR arbiter.
pub mod inbox;

/// Optional latency instrumentation.
pub mod instrument;

/// The poll-driven I/O multiplexer.
pub mod multiplexer;

/// Remote actor proxies and their registry.
pub mod proxy;

/// Socket construction helpers.
pub mod socket;

/// Transport policies and the application contract.
pub mod transport;

// Re-export the core addressing types alongside the machinery.
pub use weft_core::{
    ActorHost, ActorId, DownNotifier, Envelope, Locator, LocatorParseError, NetError, NetResult,
    NodeId,
};

pub use backend::{
    Backend, BackendEnv, NetworkModule, QuicBackend, TcpBackend, TestBackend, UdpBackend,
};
pub use basp::{BaspApplication, BaspConfig, BaspFactory};
pub use config::{NetConfig, QUIC_CERTS_ENV};
pub use endpoint::{ControlEvent, EndpointDriver, EndpointManager, OutboundItem, OutboundMessage};
pub use inbox::{DrrArbiter, Inbox, TaskSize};
pub use instrument::{Instrumentation, Sample, Stage};
pub use multiplexer::{Multiplexer, MultiplexerHandle, MpxContext, SocketManager, TimeoutTag};
pub use proxy::{BlockingResolve, ProxyRegistry, RemoteActorRef, ResolveListener};
pub use transport::{
    Application, ApplicationFactory, BufferPool, DatagramTransport, PacketInfo, PacketKind,
    PacketWriter, QuicSession, QuicStack, QuicTransport, ReceivePolicy, StreamTransport,
    TimerHandle, Transport, TransportWorker, WorkerDispatcher,
};
