//! Proxy service module
//!
//! This module implements the reordering proxy: the accept loop, the relay
//! connections it spawns, and the handle a test harness uses to drive it.
//!
//! The proxy service uses a message-driven architecture. The accept loop owns
//! every relay handle and is only reached through [`ProxyHandle`] messages.

mod forwarder;
mod message;
mod relay;
mod service;

pub use message::{
    ConnectionInfo, FrameCounts, ProxyHandle, ProxyMessage, ProxySnapshot, ReleaseReport,
    ReorderRound,
};
pub use relay::{RelayConnection, RelayHandle, RelayState};
pub use service::ReorderProxy;
