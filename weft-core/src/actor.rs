//! Actor identifiers.

use serde::{Deserialize, Serialize};

/// A 64-bit actor identifier, unique within its owning node.
///
/// The id `0` is reserved as the invalid id; it appears on the wire in
/// frames that carry no meaningful sender (heartbeats, handshakes) and in
/// resolve responses for unknown paths.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ActorId(pub u64);

impl ActorId {
    /// The invalid actor id.
    pub const INVALID: ActorId = ActorId(0);

    /// Check whether this id names an actor (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

impl From<u64> for ActorId {
    fn from(id: u64) -> Self {
        ActorId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_is_zero() {
        assert!(!ActorId::INVALID.is_valid());
        assert!(ActorId(1).is_valid());
    }

    #[test]
    fn display() {
        assert_eq!(ActorId(42).to_string(), "actor-42");
    }
}
