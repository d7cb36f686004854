//! # weft-core
//!
//! Addressing and runtime-facing types shared by the weft network layer.
//!
//! This crate carries no I/O. It defines how nodes and actors are named
//! ([`NodeId`], [`ActorId`], [`Locator`]), the unit of inbound delivery
//! ([`Envelope`]), the seam to the hosting actor runtime ([`ActorHost`]),
//! and the error type every fallible network operation returns
//! ([`NetError`]).
//!
//! The actual endpoint machinery (multiplexer, transports, proxies) lives in
//! `weft-net`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Actor identifiers.
pub mod actor;

/// Inbound delivery unit.
pub mod envelope;

/// Error types shared across the network layer.
pub mod error;

/// The seam to the hosting actor runtime.
pub mod host;

/// Locator URIs (`scheme://host:port/path`).
pub mod locator;

/// Node identifiers.
pub mod node;

pub use actor::ActorId;
pub use envelope::Envelope;
pub use error::{NetError, NetResult};
pub use host::{ActorHost, DownNotifier};
pub use locator::{Locator, LocatorParseError};
pub use node::NodeId;
