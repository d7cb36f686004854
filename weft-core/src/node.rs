//! Node identifiers.

use serde::{Deserialize, Serialize};

/// Identifies a process in the distributed system.
///
/// A node id is the origin part of a [`Locator`](crate::Locator)
/// (`scheme://host:port`), treated as an opaque value: two processes are the
/// same peer exactly when their node ids compare equal. Node ids are stable
/// across reconnects within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Build a node id from its raw origin string.
    ///
    /// Prefer [`Locator::node_id`](crate::Locator::node_id), which normalizes
    /// the origin; this constructor trusts the caller.
    pub fn from_origin(origin: impl Into<String>) -> Self {
        NodeId(origin.into())
    }

    /// The origin string, e.g. `tcp://host:4001`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_textual() {
        let a = NodeId::from_origin("tcp://a:1");
        let b = NodeId::from_origin("tcp://a:1");
        let c = NodeId::from_origin("tcp://a:2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_roundtrip() {
        let node = NodeId::from_origin("udp://node-7:9000");
        let json = serde_json::to_string(&node).expect("serialize");
        let back: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(node, back);
    }
}
