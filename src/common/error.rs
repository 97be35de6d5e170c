//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Reorder proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The listening address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The upstream server could not be reached for one client
    #[error("Failed to connect to upstream {addr}: {source}")]
    ConnectUpstream {
        /// Upstream address (host:port)
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// A frame, or the bytes held waiting for its boundary, exceeded the limit
    #[error("Frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Frame length, or bytes held without a boundary
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid reorder policy
    #[error("Policy error: {0}")]
    Policy(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl ProxyError {
    /// Build a bind error for a socket address
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr: addr.to_string(), source }
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
