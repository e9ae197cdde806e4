use std::sync::Arc;

use crate::traceback::Traceback;

/// One live allocation, as returned by
/// [`TraceEngine::traces`](crate::TraceEngine::traces).
#[derive(Clone, Debug)]
pub struct TracedAllocation {
    /// Raw address of the allocation.
    pub address: usize,

    /// Requested size in bytes.
    pub size: usize,

    /// The interned call stack that performed the allocation.
    pub traceback: Arc<Traceback>,
}

/// Cumulative totals for one source line, as returned by
/// [`TraceEngine::stats`](crate::TraceEngine::stats).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineStat {
    /// Interned source filename.
    pub filename: Arc<str>,

    /// 1-based source line, or 0 when unknown.
    pub lineno: u32,

    /// Bytes currently allocated from this line.
    pub size: usize,

    /// Number of live allocations from this line.
    pub count: usize,
}
