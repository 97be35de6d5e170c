//! Proxy message types
//!
//! This module defines the messages the harness sends to a running proxy.
//! The accept loop owns all connection state; the handle only talks to it
//! through a channel, so no lock is shared between the harness and relays.

use log::debug;
use std::net::SocketAddr;
use std::ops::Add;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};

use crate::common::{ProxyError, Result};
use crate::frame::Direction;

/// Polling interval used while waiting for frames to be captured
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frame counts split by direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    /// Frames travelling from the client to the upstream server
    pub client_to_server: usize,
    /// Frames travelling from the upstream server to the client
    pub server_to_client: usize,
}

impl FrameCounts {
    /// Count for one direction
    pub fn get(&self, direction: Direction) -> usize {
        match direction {
            Direction::ClientToServer => self.client_to_server,
            Direction::ServerToClient => self.server_to_client,
        }
    }

    /// Set the count for one direction
    pub fn set(&mut self, direction: Direction, count: usize) {
        match direction {
            Direction::ClientToServer => self.client_to_server = count,
            Direction::ServerToClient => self.server_to_client = count,
        }
    }

    /// Sum over both directions
    pub fn total(&self) -> usize {
        self.client_to_server + self.server_to_client
    }
}

impl Add for FrameCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            client_to_server: self.client_to_server + other.client_to_server,
            server_to_client: self.server_to_client + other.server_to_client,
        }
    }
}

/// Frames one relay released in a round, by direction
pub type ReleaseReport = FrameCounts;

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection id, unique per proxy
    pub id: u64,
    /// Client address
    pub source: SocketAddr,
    /// Upstream address (host:port)
    pub target: String,
    /// When the client was accepted
    pub timestamp: SystemTime,
}

/// Outcome of one reorder round across all live connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorderRound {
    /// Connections whose frames were released and written
    pub connections: usize,
    /// Connections that closed before their frames could be written
    pub failed: usize,
    /// Frames released and written, by direction
    pub frames: FrameCounts,
}

impl ReorderRound {
    /// Frames released in both directions
    pub fn total_frames(&self) -> usize {
        self.frames.total()
    }
}

/// Point-in-time view of a running proxy
#[derive(Debug, Clone, Default)]
pub struct ProxySnapshot {
    /// Live connections
    pub connections: Vec<ConnectionInfo>,
    /// Frames held and not yet released, by direction, over all connections
    pub buffered: FrameCounts,
}

impl ProxySnapshot {
    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Frames held over both directions
    pub fn buffered_frames(&self) -> usize {
        self.buffered.total()
    }
}

/// Messages that can be sent to the proxy service
#[derive(Debug)]
pub enum ProxyMessage {
    /// Release and write every buffered frame on every live connection
    TriggerReorder {
        /// Receives the round summary once all writes completed
        reply: oneshot::Sender<ReorderRound>,
    },
    /// Report live connections and buffered frames
    Snapshot {
        /// Receives the snapshot
        reply: oneshot::Sender<ProxySnapshot>,
    },
    /// Close the listener and every live connection
    Shutdown {
        /// Signalled once the listener is closed and relays have stopped
        reply: oneshot::Sender<()>,
    },
}

/// Proxy control handle
///
/// Cheap to clone. When the last handle is dropped the proxy shuts down.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    /// Message sender
    sender: mpsc::Sender<ProxyMessage>,
    /// Address the proxy listens on
    local_addr: SocketAddr,
}

impl ProxyHandle {
    /// Create a new proxy handle
    pub(crate) fn new(sender: mpsc::Sender<ProxyMessage>, local_addr: SocketAddr) -> Self {
        Self { sender, local_addr }
    }

    /// Address clients should connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message to the proxy service
    async fn send(&self, message: ProxyMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProxyError::Other("Proxy service is not running".to_string()))
    }

    /// Reorder and flush every buffered frame
    ///
    /// This is the "communicate" step of a test round: every live connection
    /// releases both directions through its policy, and this call returns once
    /// the released frames have been written to their peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy has been stopped.
    pub async fn trigger_reorder(&self) -> Result<ReorderRound> {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyMessage::TriggerReorder { reply }).await?;
        rx.await
            .map_err(|_| ProxyError::Other("Proxy stopped during reorder".to_string()))
    }

    /// Report live connections and buffered frames
    pub async fn snapshot(&self) -> Result<ProxySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyMessage::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| ProxyError::Other("Proxy stopped before answering".to_string()))
    }

    /// Wait until at least `frames` frames are buffered
    ///
    /// Relays capture frames asynchronously, so a harness that has just
    /// written to the proxy uses this before triggering a reorder.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Other` if the count is not reached within `timeout`.
    pub async fn wait_for_buffered(
        &self,
        frames: usize,
        timeout: Duration,
    ) -> Result<ProxySnapshot> {
        tokio::time::timeout(timeout, self.poll_buffered(frames))
            .await
            .map_err(|_| {
                ProxyError::Other(format!("Timed out waiting for {} buffered frames", frames))
            })?
    }

    async fn poll_buffered(&self, frames: usize) -> Result<ProxySnapshot> {
        loop {
            let snapshot = self.snapshot().await?;
            if snapshot.buffered_frames() >= frames {
                return Ok(snapshot);
            }
            tokio::time::sleep(SNAPSHOT_POLL_INTERVAL).await;
        }
    }

    /// Stop the proxy
    ///
    /// Closes the listening socket and every live connection. Frames that were
    /// buffered but not released are dropped. Stopping an already stopped
    /// proxy is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(ProxyMessage::Shutdown { reply }).await.is_err() {
            debug!("Proxy on {} already stopped", self.local_addr);
            return Ok(());
        }
        // A dropped reply means the service ended on its own, which is still a stop
        let _ = rx.await;
        Ok(())
    }
}

/// Create a new proxy message channel
///
/// Returns the handle and the receiving end for the service loop.
pub(crate) fn create_channel(
    local_addr: SocketAddr,
) -> (ProxyHandle, mpsc::Receiver<ProxyMessage>) {
    let (tx, rx) = mpsc::channel(100);
    (ProxyHandle::new(tx, local_addr), rx)
}
