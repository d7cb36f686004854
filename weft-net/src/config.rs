//! Configuration for the network module.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use weft_core::{Locator, NetError, NetResult};

/// Hard-coded defaults for recognized configuration keys.
pub mod defaults {
    /// Maximum number of cached payload buffers per transport.
    pub const MAX_PAYLOAD_BUFFERS: usize = 100;

    /// Maximum number of cached header buffers per transport.
    pub const MAX_HEADER_BUFFERS: usize = 10;

    /// Default TCP listening port (`0` = ephemeral).
    pub const TCP_PORT: u16 = 0;

    /// Default UDP listening port (`0` = ephemeral).
    pub const UDP_PORT: u16 = 0;
}

/// Environment variable overriding [`NetConfig::quic_certificates`].
pub const QUIC_CERTS_ENV: &str = "WEFT_QUIC_CERTS";

/// Configuration for a [`NetworkModule`](crate::backend::NetworkModule).
///
/// Only `this_node` is required; everything else has a sensible default.
///
/// # Examples
///
/// ```
/// use weft_net::NetConfig;
///
/// let cfg = NetConfig::new("tcp://node-a:0".parse().expect("locator"))
///     .with_tcp_port(4001)
///     .with_heartbeat(std::time::Duration::from_secs(5));
/// assert_eq!(cfg.tcp_port, 4001);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// The local node locator (required). Its origin becomes this process's
    /// node id on the wire.
    pub this_node: Locator,

    /// TCP listening port (`0` = ephemeral).
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// UDP listening port (`0` = ephemeral).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// When true, the caller drives the multiplexer; otherwise the module
    /// spawns a dedicated thread on `start`.
    #[serde(default)]
    pub manual_multiplexing: bool,

    /// Cap on cached payload buffers per transport.
    #[serde(default = "default_payload_buffers")]
    pub max_payload_buffers: usize,

    /// Cap on cached header buffers per transport.
    #[serde(default = "default_header_buffers")]
    pub max_header_buffers: usize,

    /// Interval between heartbeat frames on established connections.
    /// `None` disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval: Option<Duration>,

    /// Offer the 16-bit ordering layer during the datagram handshake.
    #[serde(default = "default_true")]
    pub enable_ordering: bool,

    /// Directory holding the QUIC certificate chain and key. Required by the
    /// quic backend; [`QUIC_CERTS_ENV`] overrides it.
    #[serde(default)]
    pub quic_certificates: Option<PathBuf>,
}

fn default_tcp_port() -> u16 {
    defaults::TCP_PORT
}

fn default_udp_port() -> u16 {
    defaults::UDP_PORT
}

fn default_payload_buffers() -> usize {
    defaults::MAX_PAYLOAD_BUFFERS
}

fn default_header_buffers() -> usize {
    defaults::MAX_HEADER_BUFFERS
}

fn default_true() -> bool {
    true
}

impl NetConfig {
    /// A configuration with defaults for everything but the node locator.
    pub fn new(this_node: Locator) -> Self {
        NetConfig {
            this_node,
            tcp_port: defaults::TCP_PORT,
            udp_port: defaults::UDP_PORT,
            manual_multiplexing: false,
            max_payload_buffers: defaults::MAX_PAYLOAD_BUFFERS,
            max_header_buffers: defaults::MAX_HEADER_BUFFERS,
            heartbeat_interval: None,
            enable_ordering: true,
            quic_certificates: None,
        }
    }

    /// Set the TCP listening port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Set the UDP listening port.
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    /// Let the caller drive the multiplexer instead of spawning a thread.
    pub fn with_manual_multiplexing(mut self) -> Self {
        self.manual_multiplexing = true;
        self
    }

    /// Enable heartbeat frames at the given interval.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Disable the datagram ordering layer.
    pub fn without_ordering(mut self) -> Self {
        self.enable_ordering = false;
        self
    }

    /// Set the QUIC certificate directory.
    pub fn with_quic_certificates(mut self, dir: PathBuf) -> Self {
        self.quic_certificates = Some(dir);
        self
    }

    /// Resolve the QUIC certificate directory: the [`QUIC_CERTS_ENV`]
    /// environment variable wins, then `quic_certificates`. There is no
    /// compiled-in fallback path; having neither is an error.
    pub fn quic_certificate_dir(&self) -> NetResult<PathBuf> {
        if let Ok(dir) = std::env::var(QUIC_CERTS_ENV) {
            return Ok(PathBuf::from(dir));
        }
        self.quic_certificates.clone().ok_or_else(|| {
            NetError::runtime(format!(
                "quic backend needs a certificate directory: set {} or the \
                 quic_certificates config key",
                QUIC_CERTS_ENV
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NetConfig {
        NetConfig::new("tcp://local:0".parse().expect("locator"))
    }

    #[test]
    fn defaults() {
        let cfg = base();
        assert_eq!(cfg.tcp_port, 0);
        assert_eq!(cfg.udp_port, 0);
        assert!(!cfg.manual_multiplexing);
        assert_eq!(cfg.max_payload_buffers, defaults::MAX_PAYLOAD_BUFFERS);
        assert_eq!(cfg.max_header_buffers, defaults::MAX_HEADER_BUFFERS);
        assert!(cfg.enable_ordering);
        assert!(cfg.heartbeat_interval.is_none());
    }

    #[test]
    fn deserialize_with_defaults() {
        let cfg: NetConfig = serde_json::from_str(
            r#"{ "this_node": { "scheme": "tcp", "host": "a", "port": 1, "path": "" },
                 "tcp_port": 4001 }"#,
        )
        .expect("deserialize");
        assert_eq!(cfg.tcp_port, 4001);
        assert_eq!(cfg.udp_port, 0);
    }

    #[test]
    fn quic_certs_require_configuration() {
        let cfg = base();
        assert!(cfg.quic_certificate_dir().is_err());
        let cfg = cfg.with_quic_certificates(PathBuf::from("/etc/weft/certs"));
        assert_eq!(
            cfg.quic_certificate_dir().expect("dir"),
            PathBuf::from("/etc/weft/certs")
        );
    }
}
