//! Remote actor proxies and their registry.
//!
//! A proxy is the local stand-in for a remote actor: it knows the owning
//! node, the remote actor id, and the endpoint manager serving that node,
//! and forwards every message into the manager's outbound inbox. The
//! registry guarantees at most one live proxy per `(node, actor)` pair and
//! prunes entries lazily once their proxies die.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};
use weft_core::{ActorId, NetError, NetResult, NodeId};

use crate::endpoint::{EndpointManager, OutboundItem, OutboundMessage};

/// Receives the outcome of a resolve request.
///
/// Implemented for any `FnOnce` closure, so call sites can pass
/// `Box::new(|result| ...)` directly.
pub trait ResolveListener: Send {
    /// Deliver the proxy or the error. Called at most once.
    fn on_resolved(self: Box<Self>, result: NetResult<Arc<RemoteActorRef>>);
}

impl<F> ResolveListener for F
where
    F: FnOnce(NetResult<Arc<RemoteActorRef>>) + Send,
{
    fn on_resolved(self: Box<Self>, result: NetResult<Arc<RemoteActorRef>>) {
        self(result)
    }
}

/// Channel-backed listener for synchronous resolves.
///
/// The sending half is the listener; dropping it unanswered (connection
/// died before the response) surfaces as an error on [`wait`] rather than a
/// hang.
///
/// [`wait`]: BlockingResolve::wait
pub struct BlockingResolve {
    rx: mpsc::Receiver<NetResult<Arc<RemoteActorRef>>>,
}

impl BlockingResolve {
    /// A connected (listener, waiter) pair.
    pub fn pair() -> (Box<dyn ResolveListener>, BlockingResolve) {
        let (tx, rx) = mpsc::channel();
        let listener = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (listener, BlockingResolve { rx })
    }

    /// Block until the resolve completes or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> NetResult<Arc<RemoteActorRef>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(NetError::timeout("resolve")),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(NetError::ShuttingDown),
        }
    }
}

/// Local stand-in for a remote actor.
///
/// Polymorphic with local actors from the runtime's point of view: it
/// accepts serialized messages and gets them to the peer. Holds a strong
/// reference to its endpoint manager; the manager holds no back-reference.
pub struct RemoteActorRef {
    node: NodeId,
    id: ActorId,
    manager: Arc<EndpointManager>,
}

impl RemoteActorRef {
    /// The node owning the remote actor.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The remote actor id.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// The endpoint manager this proxy forwards through.
    pub fn manager(&self) -> &Arc<EndpointManager> {
        &self.manager
    }

    /// Forward a serialized message to the remote actor.
    pub fn tell(&self, sender: ActorId, payload: Bytes) -> NetResult<()> {
        self.manager.enqueue_message(OutboundMessage {
            peer: self.node.clone(),
            item: OutboundItem::Message {
                sender,
                receiver: self.id,
                payload,
            },
        })
    }
}

impl std::fmt::Debug for RemoteActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteActorRef")
            .field("node", &self.node)
            .field("id", &self.id)
            .finish()
    }
}

/// Maps `(node, actor)` to a weak proxy reference.
#[derive(Default)]
pub struct ProxyRegistry {
    entries: Mutex<HashMap<(NodeId, ActorId), Weak<RemoteActorRef>>>,
}

impl ProxyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live proxy for `(node, id)` or construct one bound to
    /// `manager`. A newly constructed proxy announces itself to the peer
    /// with a monitor frame.
    pub fn get_or_make(
        &self,
        node: NodeId,
        id: ActorId,
        manager: &Arc<EndpointManager>,
    ) -> Arc<RemoteActorRef> {
        let proxy = {
            let mut entries = lock(&self.entries);
            if let Some(existing) = entries.get(&(node.clone(), id)).and_then(Weak::upgrade) {
                return existing;
            }
            // Miss: the entry (if any) is dead. Prune siblings while we are
            // here so dead pairs do not accumulate.
            entries.retain(|_, weak| weak.strong_count() > 0);
            let proxy = Arc::new(RemoteActorRef {
                node: node.clone(),
                id,
                manager: Arc::clone(manager),
            });
            entries.insert((node, id), Arc::downgrade(&proxy));
            proxy
        };
        trace!(node = %proxy.node, actor = %proxy.id, "created proxy");
        if let Err(err) = manager.enqueue_message(OutboundMessage {
            peer: proxy.node.clone(),
            item: OutboundItem::Monitor { receiver: id },
        }) {
            debug!(%err, "monitor frame dropped");
        }
        proxy
    }

    /// Drop the entry for `(node, id)`, e.g. on a down notification.
    /// Returns whether an entry existed.
    pub fn erase(&self, node: &NodeId, id: ActorId) -> bool {
        lock(&self.entries)
            .remove(&(node.clone(), id))
            .is_some()
    }

    /// Drop every entry for `node`.
    pub fn erase_node(&self, node: &NodeId) {
        lock(&self.entries).retain(|(entry_node, _), _| entry_node != node);
    }

    /// Number of live proxies.
    pub fn live_count(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

type Entries = HashMap<(NodeId, ActorId), Weak<RemoteActorRef>>;

fn lock(entries: &Mutex<Entries>) -> std::sync::MutexGuard<'_, Entries> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
