//! An arena-backed slab allocator for fixed-size metadata records.
//!
//! This crate provides [`RecordPool`], a pool that hands out fixed-size records
//! from a small set of contiguous arenas, so that creating and destroying a
//! record never performs a per-record heap allocation. It is intended for
//! bookkeeping data that is created and destroyed at very high rates, such as
//! hash table entries of an allocation tracker.
//!
//! # Key Features
//!
//! - **Stable keys**: every record is addressed by a [`RecordKey`] that stays
//!   valid until the record is removed, with no pointer arithmetic involved.
//! - **Intrusive free lists**: vacant slots form a per-arena free list encoded
//!   as slot indices, giving O(1) allocation and release.
//! - **Fragmentation-aware growth**: new arenas are sized so that repeated
//!   small reservations do not cause arena churn.
//! - **Arena reclamation**: an arena whose records have all been released is
//!   returned to the operating system, unless it is the pool's last arena.
//! - **Recoverable allocation failure**: running out of memory surfaces as
//!   [`PoolError::OutOfMemory`] instead of aborting the process.
//!
//! A pool never relocates records on its own, because callers hold the keys.
//! When the pool reaches its arena limit or its fragmentation budget, growth
//! reports [`PoolError::CompactionRequired`] and the owner of the keys must
//! rebuild the pool (see the `record_table` crate, which implements the
//! table-driven compaction used by the allocation tracker).
//!
//! # Examples
//!
//! ```rust
//! use record_pool::RecordPool;
//!
//! let mut pool = RecordPool::<u64>::new();
//!
//! let a = pool.insert(1)?;
//! let b = pool.insert(2)?;
//! assert_eq!(pool.get(a), Some(&1));
//!
//! assert_eq!(pool.remove(a), 1);
//! assert_eq!(pool.used(), 1);
//!
//! pool.remove(b);
//! assert!(pool.is_empty());
//! # Ok::<(), record_pool::PoolError>(())
//! ```

mod arena;
mod pool;

pub(crate) use arena::*;
pub use pool::{PoolError, RecordKey, RecordPool, MAX_ARENAS};
