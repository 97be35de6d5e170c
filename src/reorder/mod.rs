//! Reordering module
//!
//! Frames for one direction are held in a [`ReorderBuffer`] until the harness
//! asks for a release; the configured [`ReorderPolicy`] then decides the
//! emission order. Policies only permute, so every held frame is emitted
//! exactly once.

mod buffer;
mod policy;

pub use buffer::{BufferFull, ReorderBuffer};
pub use policy::{is_bijection, Identity, ReorderPolicy, SwapPattern, WindowReversal};
