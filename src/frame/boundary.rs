//! Frame boundary rules

use bytes::Bytes;
use std::fmt;

use crate::common::{ProxyError, Result};

/// Decides where one frame ends in a byte stream
///
/// Implementations must be pure: the same prefix always yields the same
/// answer, and a returned length never exceeds `buf.len()`.
pub trait BoundaryRule: Send + Sync + fmt::Debug {
    /// Length of the first complete frame in `buf`, boundary included
    ///
    /// `from` is an offset previously returned by [`BoundaryRule::resume_from`]
    /// for a prefix of `buf`; bytes before it need not be examined again.
    /// Returns `None` when `buf` does not yet hold a complete frame.
    fn frame_len(&self, buf: &[u8], from: usize) -> Option<usize>;

    /// Where the next scan may start after `buf` held no complete frame
    fn resume_from(&self, _buf: &[u8]) -> usize {
        0
    }
}

/// Frames terminated by a fixed byte sequence
///
/// The delimiter stays attached to the frame it terminates.
#[derive(Clone, PartialEq, Eq)]
pub struct Delimiter {
    pattern: Bytes,
}

impl Delimiter {
    /// Create a delimiter rule
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` if `pattern` is empty.
    pub fn new(pattern: impl Into<Bytes>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(ProxyError::Config("Frame delimiter must not be empty".to_string()));
        }
        Ok(Self { pattern })
    }

    /// Newline-terminated frames
    pub fn newline() -> Self {
        Self { pattern: Bytes::from_static(b"\n") }
    }

    /// The terminator bytes
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::newline()
    }
}

impl fmt::Debug for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delimiter")
            .field("pattern", &String::from_utf8_lossy(&self.pattern))
            .finish()
    }
}

impl BoundaryRule for Delimiter {
    fn frame_len(&self, buf: &[u8], from: usize) -> Option<usize> {
        let needle = self.pattern.as_ref();
        let from = from.min(buf.len());
        if buf.len() - from < needle.len() {
            return None;
        }
        buf[from..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|start| from + start + needle.len())
    }

    fn resume_from(&self, buf: &[u8]) -> usize {
        // A delimiter may have started in the last `len - 1` bytes
        buf.len().saturating_sub(self.pattern.len() - 1)
    }
}
