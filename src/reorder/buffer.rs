//! Reorder buffer for one direction of one connection

use log::error;
use std::fmt;
use std::sync::Arc;

use super::policy::{is_bijection, ReorderPolicy};
use crate::frame::{Direction, Frame};

/// Returned by [`ReorderBuffer::accept`] when the buffer is at capacity
///
/// Carries the rejected frame back so the caller can retry once a release
/// has freed space.
pub struct BufferFull(pub Frame);

impl BufferFull {
    /// Take back the rejected frame
    pub fn into_frame(self) -> Frame {
        self.0
    }
}

impl fmt::Debug for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferFull")
            .field("sequence", &self.0.sequence())
            .finish()
    }
}

impl fmt::Display for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reorder buffer full, frame {} rejected", self.0.sequence())
    }
}

impl std::error::Error for BufferFull {}

/// Holds frames until an explicit release
///
/// Frames are stored in arrival order; `release` applies the policy over all
/// of them at once.
#[derive(Debug)]
pub struct ReorderBuffer {
    direction: Direction,
    capacity: usize,
    policy: Arc<dyn ReorderPolicy>,
    frames: Vec<Frame>,
}

impl ReorderBuffer {
    /// Create an empty buffer
    ///
    /// A capacity of zero is treated as one so a single frame can always make
    /// progress.
    pub fn new(direction: Direction, capacity: usize, policy: Arc<dyn ReorderPolicy>) -> Self {
        let capacity = capacity.max(1);
        Self {
            direction,
            capacity,
            policy,
            frames: Vec::with_capacity(capacity.min(64)),
        }
    }

    /// Store a frame
    ///
    /// Never blocks. Fails with [`BufferFull`] when the buffer already holds
    /// `capacity` frames; nothing held is ever overwritten.
    pub fn accept(&mut self, frame: Frame) -> std::result::Result<(), BufferFull> {
        if self.is_full() {
            return Err(BufferFull(frame));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Take every held frame in emission order
    ///
    /// The buffer is empty afterwards. With fewer than two frames this is the
    /// arrival order.
    pub fn release(&mut self) -> Vec<Frame> {
        let held = std::mem::take(&mut self.frames);
        if held.len() < 2 {
            return held;
        }

        let order = self.policy.permutation(held.len());
        if !is_bijection(&order, held.len()) {
            error!(
                "[{}] policy {} returned an invalid permutation for {} frames, \
                 keeping arrival order",
                self.direction,
                self.policy.name(),
                held.len()
            );
            return held;
        }

        let mut slots: Vec<Option<Frame>> = held.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect()
    }

    /// Drop every held frame, returning how many were dropped
    pub fn discard(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }

    /// Number of frames held
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are held
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether another frame would be rejected
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Maximum number of frames held at once
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Direction this buffer serves
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Policy applied on release
    pub fn policy(&self) -> &Arc<dyn ReorderPolicy> {
        &self.policy
    }
}
