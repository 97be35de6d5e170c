//! Reorder policies
//!
//! A policy maps the frames held at release time to an emission order. It
//! only ever permutes indices; the buffer checks the result before applying it.

use std::fmt;

use crate::common::{ProxyError, Result};

/// Permutation rule applied to buffered frames at release time
pub trait ReorderPolicy: Send + Sync + fmt::Debug {
    /// Emission order for `len` frames held in arrival order
    ///
    /// Element `i` of the result is the arrival index of the frame emitted
    /// `i`-th. The result must be a permutation of `0..len`.
    fn permutation(&self, len: usize) -> Vec<usize>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Check that `order` is a permutation of `0..len`
pub fn is_bijection(order: &[usize], len: usize) -> bool {
    if order.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &index in order {
        match seen.get_mut(index) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

/// Reverse each full window of consecutive frames
///
/// With a window of 2, `[A, B, C, D]` is emitted as `[B, A, D, C]` and
/// `[A, B, C]` as `[B, A, C]`: an incomplete trailing window passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReversal {
    window: usize,
}

impl WindowReversal {
    /// Create a window reversal policy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Policy` if `window` is smaller than 2, since such a
    /// window never reorders anything.
    pub fn new(window: usize) -> Result<Self> {
        if window < 2 {
            return Err(ProxyError::Policy(format!(
                "Window size must be at least 2, got {}",
                window
            )));
        }
        Ok(Self { window })
    }

    /// Configured window size
    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for WindowReversal {
    fn default() -> Self {
        Self { window: 2 }
    }
}

impl ReorderPolicy for WindowReversal {
    fn permutation(&self, len: usize) -> Vec<usize> {
        let full = len - len % self.window;
        let mut order = Vec::with_capacity(len);
        for start in (0..full).step_by(self.window) {
            order.extend((start..start + self.window).rev());
        }
        order.extend(full..len);
        order
    }

    fn name(&self) -> &'static str {
        "window-reversal"
    }
}

/// Apply an explicit permutation to each full block of frames
///
/// A pattern of `[2, 0, 1]` emits every block of three as
/// `[third, first, second]`; a trailing block shorter than the pattern
/// passes through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPattern {
    pattern: Vec<usize>,
}

impl SwapPattern {
    /// Create a swap pattern policy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Policy` if `pattern` is empty or not a permutation
    /// of `0..pattern.len()`.
    pub fn new(pattern: Vec<usize>) -> Result<Self> {
        if pattern.is_empty() || !is_bijection(&pattern, pattern.len()) {
            return Err(ProxyError::Policy(format!(
                "Swap pattern {:?} is not a permutation of 0..{}",
                pattern,
                pattern.len()
            )));
        }
        Ok(Self { pattern })
    }

    /// The per-block permutation
    pub fn pattern(&self) -> &[usize] {
        &self.pattern
    }
}

impl ReorderPolicy for SwapPattern {
    fn permutation(&self, len: usize) -> Vec<usize> {
        let block = self.pattern.len();
        let full = len - len % block;
        let mut order = Vec::with_capacity(len);
        for start in (0..full).step_by(block) {
            order.extend(self.pattern.iter().map(|offset| start + offset));
        }
        order.extend(full..len);
        order
    }

    fn name(&self) -> &'static str {
        "swap-pattern"
    }
}

/// Emit frames in arrival order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity;

impl ReorderPolicy for Identity {
    fn permutation(&self, len: usize) -> Vec<usize> {
        (0..len).collect()
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}
