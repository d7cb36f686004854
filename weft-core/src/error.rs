//! Error types shared across the network layer.

use crate::LocatorParseError;

/// Result alias used throughout the network layer.
pub type NetResult<T> = Result<T, NetError>;

/// Errors produced by the network layer.
///
/// The variants mirror how the layer reacts to them: [`WouldBlock`] is
/// swallowed at the I/O layer and retried on the next readiness event,
/// [`Disconnected`] and [`Protocol`] are fatal to one connection,
/// [`Runtime`] escalates, and [`Timeout`]/[`ShuttingDown`] only ever reach
/// the listener that was waiting.
///
/// [`WouldBlock`]: NetError::WouldBlock
/// [`Disconnected`]: NetError::Disconnected
/// [`Protocol`]: NetError::Protocol
/// [`Runtime`]: NetError::Runtime
/// [`Timeout`]: NetError::Timeout
/// [`ShuttingDown`]: NetError::ShuttingDown
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// No backend is registered for the URI scheme.
    #[error("no backend registered for scheme: {scheme}")]
    InvalidScheme {
        /// The scheme nobody claimed.
        scheme: String,
    },

    /// The operation cannot complete right now; retry on the next readiness
    /// event.
    #[error("operation would block")]
    WouldBlock,

    /// The peer closed the connection cleanly.
    #[error("peer disconnected")]
    Disconnected,

    /// Magic/version mismatch or a malformed frame.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },

    /// Unexpected OS or library failure.
    #[error("runtime error: {message}")]
    Runtime {
        /// What failed.
        message: String,
    },

    /// A deadline passed before the operation completed.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The network layer is shutting down; queued work was dropped.
    #[error("network layer is shutting down")]
    ShuttingDown,
}

impl NetError {
    /// Build a [`NetError::Protocol`] from anything displayable.
    pub fn protocol(message: impl std::fmt::Display) -> Self {
        NetError::Protocol {
            message: message.to_string(),
        }
    }

    /// Build a [`NetError::Runtime`] from anything displayable.
    pub fn runtime(message: impl std::fmt::Display) -> Self {
        NetError::Runtime {
            message: message.to_string(),
        }
    }

    /// Build a [`NetError::Timeout`] for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        NetError::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the error is transient: the I/O layer retries it on the next
    /// readiness event instead of tearing anything down.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    /// Whether the error represents a clean peer close rather than a fault.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, NetError::Disconnected)
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock => NetError::WouldBlock,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => NetError::Disconnected,
            ErrorKind::TimedOut => NetError::timeout("io"),
            _ => NetError::runtime(err),
        }
    }
}

impl From<LocatorParseError> for NetError {
    fn from(err: LocatorParseError) -> Self {
        NetError::protocol(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_error_mapping() {
        let would_block: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(would_block, NetError::WouldBlock);
        assert!(would_block.is_transient());

        let reset: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(reset, NetError::Disconnected);
        assert!(reset.is_clean_close());

        let other: NetError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, NetError::Runtime { .. }));
    }
}
