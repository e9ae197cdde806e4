use thiserror::Error;

use crate::filters::MAX_JOKERS;
use crate::traceback::MAX_FRAMES;

/// Invalid configuration, rejected synchronously by the call that
/// introduced it.
///
/// Configuration errors never affect tracking that is already in progress.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    /// The requested frame limit exceeds [`MAX_FRAMES`].
    #[error("frame limit {0} exceeds the maximum of {max}", max = MAX_FRAMES)]
    FrameLimitTooLarge(usize),

    /// A filter pattern contains more than [`MAX_JOKERS`] wildcards after
    /// collapsing.
    #[error("filter pattern contains more than {} wildcards", MAX_JOKERS)]
    TooManyJokers,

    /// A task was configured with a zero delay.
    #[error("task delay must be non-zero")]
    ZeroDelay,

    /// A task was configured with a zero memory threshold.
    #[error("task memory threshold must be non-zero")]
    ZeroThreshold,

    /// A task was scheduled with a repeat count of zero.
    #[error("task repeat count must be non-zero")]
    ZeroRepeat,

    /// A task has neither a delay nor a memory threshold, so it could never
    /// fire.
    #[error("task needs a delay or a memory threshold to ever fire")]
    NoTrigger,
}
