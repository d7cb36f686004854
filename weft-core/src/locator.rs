//! Locator URIs.
//!
//! A locator names a remote actor: `scheme://host:port/path`. The scheme
//! selects a backend (`tcp`, `udp`, `quic`, `test`), the authority names the
//! peer process, and the path names an actor published on that peer.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A parsed locator URI.
///
/// # Examples
///
/// ```
/// use weft_core::Locator;
///
/// let loc: Locator = "tcp://db-node:4001/ledger".parse().expect("parse");
/// assert_eq!(loc.scheme(), "tcp");
/// assert_eq!(loc.host(), "db-node");
/// assert_eq!(loc.port(), 4001);
/// assert_eq!(loc.path(), "ledger");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

/// Errors produced while parsing a [`Locator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorParseError {
    /// The input did not contain a `scheme://` prefix.
    #[error("missing scheme in locator: {input}")]
    MissingScheme {
        /// The offending input.
        input: String,
    },

    /// The authority (`host:port`) part was empty.
    #[error("missing authority in locator: {input}")]
    MissingAuthority {
        /// The offending input.
        input: String,
    },

    /// The port was present but not a valid u16.
    #[error("invalid port in locator: {value}")]
    InvalidPort {
        /// The unparseable port text.
        value: String,
    },
}

impl Locator {
    /// Build a locator from parts.
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Locator {
            scheme: scheme.into(),
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// The URI scheme; selects the backend.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host part of the authority.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part of the authority (`0` when absent).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The path naming an actor on the peer, without the leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The authority string, `host:port`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The node id for the process this locator points at
    /// (`scheme://host:port`).
    pub fn node_id(&self) -> NodeId {
        NodeId::from_origin(format!("{}://{}:{}", self.scheme, self.host, self.port))
    }

    /// A copy of this locator pointing at a different actor path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Locator {
            path: path.into(),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Locator {
    type Err = LocatorParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| LocatorParseError::MissingScheme {
                input: input.to_string(),
            })?;
        if scheme.is_empty() {
            return Err(LocatorParseError::MissingScheme {
                input: input.to_string(),
            });
        }
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(LocatorParseError::MissingAuthority {
                input: input.to_string(),
            });
        }
        // IPv6 authorities are bracketed: `[::1]:4001`. The port separator is
        // the last colon outside the brackets.
        let (host, port) = if let Some(bracket_end) = authority.rfind(']') {
            let host = &authority[..=bracket_end];
            match authority[bracket_end + 1..].strip_prefix(':') {
                Some(port_text) => (host, Some(port_text)),
                None => (host, None),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port_text)) => (host, Some(port_text)),
                None => (authority, None),
            }
        };
        let port = match port {
            Some(text) => text
                .parse::<u16>()
                .map_err(|_| LocatorParseError::InvalidPort {
                    value: text.to_string(),
                })?,
            None => 0,
        };
        Ok(Locator::new(scheme, host, port, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let loc: Locator = "tcp://example:4001/calc".parse().expect("parse");
        assert_eq!(loc.scheme(), "tcp");
        assert_eq!(loc.host(), "example");
        assert_eq!(loc.port(), 4001);
        assert_eq!(loc.path(), "calc");
    }

    #[test]
    fn parse_without_port_or_path() {
        let loc: Locator = "test://nodeB".parse().expect("parse");
        assert_eq!(loc.port(), 0);
        assert_eq!(loc.path(), "");
    }

    #[test]
    fn parse_ipv6_authority() {
        let loc: Locator = "udp://[::1]:9000/srv".parse().expect("parse");
        assert_eq!(loc.host(), "[::1]");
        assert_eq!(loc.port(), 9000);
        assert_eq!(loc.path(), "srv");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "no-scheme-here".parse::<Locator>(),
            Err(LocatorParseError::MissingScheme { .. })
        ));
        assert!(matches!(
            "tcp:///path".parse::<Locator>(),
            Err(LocatorParseError::MissingAuthority { .. })
        ));
        assert!(matches!(
            "tcp://host:notaport/x".parse::<Locator>(),
            Err(LocatorParseError::InvalidPort { .. })
        ));
    }

    #[test]
    fn node_id_drops_the_path() {
        let a: Locator = "tcp://h:1/x".parse().expect("parse");
        let b: Locator = "tcp://h:1/y".parse().expect("parse");
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn display_roundtrip() {
        let loc: Locator = "quic://peer:7000/inbox".parse().expect("parse");
        assert_eq!(loc.to_string(), "quic://peer:7000/inbox");
        let back: Locator = loc.to_string().parse().expect("reparse");
        assert_eq!(loc, back);
    }
}
