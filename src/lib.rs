//! Reorder Proxy: frame-reordering TCP relay for protocol robustness tests
//!
//! The proxy sits between a client under test and a real server. It cuts both
//! directions of every relayed connection into frames, holds them, and on
//! request releases them in a permuted order so the peers observe
//! out-of-order delivery.
//!
//! # Main Features
//!
//! - Transparent TCP relay, one upstream connection per accepted client
//! - Pluggable frame boundaries (delimiter framing by default)
//! - Pluggable reorder policies (window reversal, explicit swap patterns)
//! - Backpressure instead of frame loss when a buffer fills up
//! - Layered configuration from file, environment and command line
//!
//! # Example
//!
//! ```no_run
//! use reorder_proxy::{ReorderProxy, Result};
//! use reorder_proxy::reorder::WindowReversal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Proxy on 127.0.0.1:15224 in front of a server on 127.0.0.1:5222
//!     let proxy = ReorderProxy::new(
//!         "127.0.0.1",
//!         15224,
//!         "127.0.0.1",
//!         5222,
//!         Arc::new(WindowReversal::default()),
//!     )?;
//!     let handle = proxy.start();
//!
//!     // ... let the client under test talk through the proxy ...
//!
//!     // Release everything captured so far, reordered
//!     let round = handle.trigger_reorder().await?;
//!     println!("released {} frames", round.total_frames());
//!
//!     handle.stop().await
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod frame;
pub mod proxy;
pub mod reorder;

// Re-export commonly used structures and functions for convenience
pub use crate::common::{init_logger, parse_socket_addr, ProxyError, Result};
pub use crate::config::{ConfigBuilder, ProxyConfig};
pub use crate::frame::{Direction, Frame};
pub use crate::proxy::{ProxyHandle, ProxySnapshot, ReorderProxy, ReorderRound};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
