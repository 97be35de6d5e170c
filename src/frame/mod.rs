//! Frame module
//!
//! A frame is one complete protocol unit cut out of a relayed byte stream.
//! Frames are produced by the [`FrameSplitter`] and carried unchanged through
//! the reorder buffers to the peer socket.

mod boundary;
mod splitter;

pub use boundary::{BoundaryRule, Delimiter};
pub use splitter::FrameSplitter;

use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// One of the two independent byte streams of a relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes written by the client, headed for the upstream server
    ClientToServer,
    /// Bytes written by the upstream server, headed for the client
    ServerToClient,
}

impl Direction {
    /// Both directions, in a fixed order
    pub const ALL: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }

    /// Stable label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client->server",
            Self::ServerToClient => "server->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete protocol unit
///
/// The payload is immutable and includes the boundary bytes, so writing the
/// payloads of all frames back to back reproduces the original stream.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Bytes,
    sequence: u64,
    direction: Direction,
    received_at: Instant,
}

impl Frame {
    /// Create a frame stamped with the current time
    pub fn new(direction: Direction, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sequence,
            direction,
            received_at: Instant::now(),
        }
    }

    /// Raw bytes of the frame, boundary included
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Per-direction arrival sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Direction the frame travels in
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// When the splitter recognised the frame
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consume the frame, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
