//! Socket construction helpers.
//!
//! Thin wrappers that produce non-blocking `mio` handles with the options
//! the endpoint layer expects. Each returned handle is exclusively owned by
//! one transport or manager and releases its descriptor on drop.

use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};

use mio::net::{TcpListener, TcpStream, UdpSocket, UnixStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use weft_core::{NetError, NetResult};

/// Create two connected stream sockets, mimicking network communication
/// without a kernel listener. Used by the test backend and unit tests.
pub fn stream_socket_pair() -> NetResult<(UnixStream, UnixStream)> {
    UnixStream::pair().map_err(NetError::from)
}

/// Bind a non-blocking TCP listener on the wildcard address.
///
/// Goes through `socket2` so the listener gets `SO_REUSEADDR` before the
/// bind, which `mio` alone does not expose.
pub fn bind_tcp_listener(port: u16) -> NetResult<TcpListener> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Bind a non-blocking UDP socket on the wildcard address.
pub fn bind_udp(port: u16) -> NetResult<UdpSocket> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    UdpSocket::bind(addr).map_err(NetError::from)
}

/// Resolve `host:port` to a socket address.
pub fn resolve_addr(host: &str, port: u16) -> NetResult<SocketAddr> {
    // Bracketed IPv6 hosts come straight from a locator authority.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(NetError::from)?
        .next()
        .ok_or_else(|| NetError::runtime(format!("no address for {host}:{port}")))
}

/// Dial a peer and hand back a non-blocking stream with nodelay set.
///
/// The connect itself is blocking; callers sit on backend threads, never on
/// the multiplexer thread.
pub fn dial_tcp(host: &str, port: u16) -> NetResult<TcpStream> {
    let addr = resolve_addr(host, port)?;
    let stream = StdTcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream))
}

/// Enable or disable TCP keepalive probes on an accepted or dialed stream.
pub fn keepalive(stream: &TcpStream, enable: bool) -> NetResult<()> {
    SockRef::from(stream)
        .set_keepalive(enable)
        .map_err(NetError::from)
}
