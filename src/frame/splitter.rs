//! Incremental frame splitter
//!
//! Bytes are pushed in whatever chunks the socket delivers; complete frames
//! are cut off the front of the internal buffer as soon as the boundary rule
//! recognises them.

use bytes::BytesMut;
use std::sync::Arc;
use tokio_util::codec::Decoder;

use super::{BoundaryRule, Direction, Frame};
use crate::common::{ProxyError, Result};

/// Splits one direction's byte stream into frames
///
/// Works as a [`Decoder`] under `FramedRead`, or standalone through
/// [`push`](FrameSplitter::push) and [`next_frame`](FrameSplitter::next_frame).
#[derive(Debug)]
pub struct FrameSplitter {
    direction: Direction,
    rule: Arc<dyn BoundaryRule>,
    /// Bytes pushed in standalone use
    buffer: BytesMut,
    max_frame_size: usize,
    next_sequence: u64,
    /// Prefix of the unconsumed bytes already searched for a boundary
    scanned: usize,
}

impl FrameSplitter {
    /// Create a splitter for one direction
    ///
    /// # Parameters
    ///
    /// * `direction` - Direction stamped on every produced frame
    /// * `rule` - Boundary rule deciding where frames end
    /// * `max_frame_size` - Largest frame, boundary included, and the most
    ///   bytes held while waiting for a boundary
    pub fn new(direction: Direction, rule: Arc<dyn BoundaryRule>, max_frame_size: usize) -> Self {
        Self {
            direction,
            rule,
            buffer: BytesMut::new(),
            max_frame_size,
            next_sequence: 0,
            scanned: 0,
        }
    }

    /// Append raw bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cut the next complete frame off the pushed bytes
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::FrameTooLarge` when a frame, or the bytes held
    /// without a boundary, exceed the configured maximum.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let frame = self.decode(&mut buffer);
        self.buffer = buffer;
        frame
    }

    /// Drain every complete frame currently available
    ///
    /// # Errors
    ///
    /// See [`FrameSplitter::next_frame`]. Frames cut before the error are lost
    /// along with the connection.
    pub fn frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Pushed bytes retained without a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence number the next frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Direction this splitter serves
    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn too_large(&self, size: usize) -> ProxyError {
        ProxyError::FrameTooLarge { size, limit: self.max_frame_size }
    }
}

impl Decoder for FrameSplitter {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.rule.frame_len(&src[..], self.scanned) {
            Some(len) if len > 0 && len <= src.len() => {
                if len > self.max_frame_size {
                    return Err(self.too_large(len));
                }
                self.scanned = 0;
                let payload = src.split_to(len).freeze();
                let frame = Frame::new(self.direction, self.next_sequence, payload);
                self.next_sequence += 1;
                Ok(Some(frame))
            }
            _ if src.len() > self.max_frame_size => Err(self.too_large(src.len())),
            _ => {
                self.scanned = self.rule.resume_from(&src[..]);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // A trailing partial frame is dropped with the connection, not an error
        self.decode(src)
    }
}
