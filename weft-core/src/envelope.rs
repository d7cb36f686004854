//! Inbound delivery unit.

use bytes::Bytes;

use crate::{ActorId, NodeId};

/// A message re-materialized from the wire, ready for local dispatch.
///
/// The payload is opaque to the network layer; whatever serialization the
/// actor runtime applied on the sending side comes out unchanged here.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The node the message came from.
    pub sender_node: NodeId,
    /// The sending actor on that node ([`ActorId::INVALID`] for anonymous
    /// sends).
    pub sender: ActorId,
    /// The local actor the message is addressed to.
    pub receiver: ActorId,
    /// The serialized actor message.
    pub payload: Bytes,
}
