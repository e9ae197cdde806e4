use std::fmt;

use smallvec::SmallVec;

/// One frame as reported by a [`StackProvider`], before interning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceFrame {
    /// Source filename of the executing code.
    pub filename: String,

    /// 1-based source line, or 0 when unknown.
    pub lineno: u32,
}

/// Frame buffer handed between a provider and the engine.
///
/// Sized so stacks within the default frame limits never spill to the heap.
pub type FrameBuffer = SmallVec<[SourceFrame; 8]>;

/// Captures the currently executing logical call stack.
///
/// This is the seam between the tracker and the host runtime: the engine
/// treats the returned frames as authoritative and does not validate their
/// contents. Providers are called with the engine's reentrancy guard set, so
/// they may allocate freely without being tracked themselves.
pub trait StackProvider: Send {
    /// Returns up to `limit` frames, innermost first.
    ///
    /// Returning no frames is valid; the engine then records the allocation
    /// against its "unknown origin" sentinel stack.
    fn capture(&mut self, limit: usize) -> FrameBuffer;
}

/// A provider that captures nothing.
///
/// Every allocation tracked through it is attributed to the sentinel stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProvider;

impl StackProvider for NullProvider {
    fn capture(&mut self, _limit: usize) -> FrameBuffer {
        FrameBuffer::new()
    }
}

/// Adapts a closure into a [`StackProvider`].
///
/// Useful for hosts whose stack capture is a plain function, and for tests
/// that script the stacks the engine sees.
pub struct FnProvider<F>(F);

impl<F> FnProvider<F>
where
    F: FnMut(usize) -> FrameBuffer + Send,
{
    /// Wraps a capture closure.
    pub fn new(capture: F) -> Self {
        Self(capture)
    }
}

impl<F> StackProvider for FnProvider<F>
where
    F: FnMut(usize) -> FrameBuffer + Send,
{
    fn capture(&mut self, limit: usize) -> FrameBuffer {
        (self.0)(limit)
    }
}

impl<F> fmt::Debug for FnProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProvider").finish_non_exhaustive()
    }
}
