//! The seam to the hosting actor runtime.

use crate::{ActorId, Envelope, NodeId};

/// Invoked by the host when a watched local actor terminates.
///
/// The network layer hands one of these to [`ActorHost::watch`] whenever a
/// peer monitors a local actor; the host calls [`actor_down`] at most once.
///
/// [`actor_down`]: DownNotifier::actor_down
pub trait DownNotifier: Send {
    /// Report that the watched actor terminated.
    fn actor_down(self: Box<Self>, actor: ActorId);
}

impl<F: FnOnce(ActorId) + Send> DownNotifier for F {
    fn actor_down(self: Box<Self>, actor: ActorId) {
        self(actor)
    }
}

/// What the network layer needs from the actor runtime it serves.
///
/// Implementations must be callable from the multiplexer thread and from
/// host callbacks; all methods are `&self`.
pub trait ActorHost: Send + Sync {
    /// Dispatch an inbound message to the local runtime.
    fn deliver(&self, envelope: Envelope);

    /// Look up a published path in the local registry.
    fn lookup(&self, path: &str) -> Option<ActorId>;

    /// The interface names advertised for a local actor in resolve
    /// responses. Defaults to none.
    fn interfaces_of(&self, _actor: ActorId) -> Vec<String> {
        Vec::new()
    }

    /// Watch a local actor on behalf of a remote peer.
    ///
    /// The host invokes `notifier` when the actor terminates; if the actor is
    /// already dead (or unknown), it invokes it immediately. The default
    /// implementation treats every actor as immortal and drops the notifier.
    fn watch(&self, actor: ActorId, notifier: Box<dyn DownNotifier>) {
        let _ = (actor, notifier);
    }

    /// A remote actor this runtime held proxies for has terminated.
    fn peer_down(&self, _node: &NodeId, _actor: ActorId) {}
}
