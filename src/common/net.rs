//! Network utility functions
//!
//! This module provides utility functions for network operations.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use tokio::net::TcpListener;

use super::error::{ProxyError, Result};

/// Listen backlog for proxy sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Parse a socket address
///
/// Accepts literal addresses as well as resolvable `host:port` strings.
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ProxyError::Config(format!("Failed to parse address: {}", addr))),
        Err(e) => Err(ProxyError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Resolve a host and port pair into a socket address
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    parse_socket_addr(&format!("{}:{}", host, port))
}

/// Bind a non-blocking TCP listener with address reuse enabled
///
/// Test harnesses restart proxies on the same port between rounds, so
/// `SO_REUSEADDR` is set before binding.
///
/// # Errors
///
/// Returns `ProxyError::Bind` if the address is unavailable.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProxyError::bind(addr, e))?;

    socket
        .set_reuse_address(true)
        .and_then(|_| socket.set_nodelay(true))
        .and_then(|_| socket.set_nonblocking(true))
        .and_then(|_| socket.bind(&addr.into()))
        .and_then(|_| socket.listen(LISTEN_BACKLOG))
        .map_err(|e| ProxyError::bind(addr, e))?;

    TcpListener::from_std(socket.into()).map_err(|e| ProxyError::bind(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:8080");
        assert!(addr.is_ok(), "Should be able to parse a valid address");
        assert_eq!(addr.unwrap().port(), 8080);

        let addr = parse_socket_addr("invalid-address");
        assert!(addr.is_err(), "Should fail to parse an invalid address");
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("localhost", 5222).unwrap();
        assert_eq!(addr.port(), 5222);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_listener_reports_bind_error() {
        // TEST-NET-1 is never assigned to a local interface
        let err = bind_listener("192.0.2.1:0".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
