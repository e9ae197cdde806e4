use std::sync::Arc;

/// Upper bound on the number of frames kept per traceback.
///
/// Also the upper bound of the engine's frame limit; a provider returning
/// more frames than this has the excess dropped.
pub const MAX_FRAMES: usize = 100;

// Structural hash mixing constants. The multiplier is perturbed per frame
// position so equal-length stacks that differ only in frame order do not
// cluster.
const HASH_SEED: u64 = 0x345678;
const HASH_MULTIPLIER: u64 = 1_000_003;
const HASH_PERTURB: u64 = 82_520;
const HASH_TAIL: u64 = 97_531;

/// One call-stack frame: an interned filename handle and a line number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Interned source filename. Frames never own the string; the interning
    /// table does.
    pub filename: Arc<str>,

    /// 1-based source line, or 0 when unknown.
    pub lineno: u32,
}

/// An immutable, interned call-stack snapshot.
///
/// Frames are ordered innermost first. Tracebacks are deduplicated by the
/// engine: structurally identical stacks share one `Arc<Traceback>`, so a
/// trace costs one handle clone regardless of stack depth.
#[derive(Debug, Eq, PartialEq)]
pub struct Traceback {
    frames: Box<[Frame]>,

    /// Structural hash over (filename, lineno) pairs, precomputed once.
    hash: u64,
}

impl Traceback {
    /// Builds a traceback, computing the structural hash with the caller's
    /// filename hash function.
    ///
    /// The same filename hash function must be used for every traceback that
    /// ends up in one interning table.
    pub(crate) fn new(frames: Box<[Frame]>, filename_hash: impl Fn(&str) -> u64) -> Self {
        let hash = structural_hash(&frames, filename_hash);
        Self { frames, hash }
    }

    /// The frames of this stack, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The innermost frame; statistics are keyed by it.
    #[must_use]
    pub fn top_frame(&self) -> &Frame {
        self.frames
            .first()
            .expect("tracebacks always hold at least the sentinel frame")
    }

    #[must_use]
    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }
}

fn structural_hash(frames: &[Frame], filename_hash: impl Fn(&str) -> u64) -> u64 {
    let mut x = HASH_SEED;
    let mut mult = HASH_MULTIPLIER;
    let mut remaining = frames.len() as u64;

    for frame in frames {
        remaining -= 1;

        let y = filename_hash(&frame.filename) ^ u64::from(frame.lineno);
        x = (x ^ y).wrapping_mul(mult);
        mult = mult.wrapping_add(HASH_PERTURB + 2 * remaining);
    }

    x.wrapping_add(HASH_TAIL)
}
