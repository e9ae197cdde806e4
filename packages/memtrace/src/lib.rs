//! Runtime memory-allocation tracking.
//!
//! This crate records the size and call-stack origin of every live
//! allocation in an allocation domain: an interposition layer (such as
//! [`TracingAllocator`]) reports each allocation, reallocation and free to a
//! [`TraceEngine`], which captures a bounded call stack through a
//! [`StackProvider`], interns it, applies the configured filters and
//! maintains a live-trace table, per-source-line statistics and cumulative
//! traced-memory counters.
//!
//! # Key Features
//!
//! - **Hot-path friendly bookkeeping**: all metadata lives in arena-backed
//!   record pools (`record_pool` / `record_table`), so tracking an event
//!   does not itself churn the allocator being observed.
//! - **Interned call stacks**: structurally identical stacks share one
//!   [`Traceback`] handle; repeated allocations from the same site cost one
//!   handle clone.
//! - **Filters**: include/exclude wildcard patterns over filenames and line
//!   numbers decide what gets recorded.
//! - **Deferred tasks**: callbacks fire when traced memory drifts past a
//!   threshold or a delay elapses, executed at a safe point rather than
//!   inside the allocation path.
//! - **Reentrancy safe**: a thread-local guard keeps the tracker's own
//!   allocations out of its tables, so the engine can observe the very
//!   allocator it runs on.
//!
//! # Examples
//!
//! ```rust
//! use memtrace::{FnProvider, SourceFrame, TraceEngine};
//!
//! let provider = FnProvider::new(|limit| {
//!     [SourceFrame {
//!         filename: String::from("app/main.py"),
//!         lineno: 42,
//!     }]
//!     .into_iter()
//!     .take(limit)
//!     .collect()
//! });
//!
//! let engine = TraceEngine::new(Box::new(provider))?;
//! engine.enable();
//!
//! engine.on_alloc(0x1000, 256);
//! assert_eq!(engine.traced_memory(), (256, 256));
//!
//! let traces = engine.traces()?;
//! assert_eq!(traces[0].size, 256);
//! assert_eq!(&*traces[0].traceback.top_frame().filename, "app/main.py");
//!
//! engine.on_free(0x1000);
//! assert_eq!(engine.traced_memory(), (0, 256));
//! # Ok::<(), memtrace::PoolError>(())
//! ```

mod allocator;
mod engine;
mod error;
mod filters;
mod intern;
mod snapshot;
mod stack;
mod tasks;
mod traceback;

pub use allocator::TracingAllocator;
pub use engine::TraceEngine;
pub use error::ConfigError;
pub use filters::{Filter, MAX_JOKERS};
pub use record_pool::PoolError;
pub use snapshot::{LineStat, TracedAllocation};
pub use stack::{FnProvider, FrameBuffer, NullProvider, SourceFrame, StackProvider};
pub use tasks::{Task, TaskCallback, TaskError, TaskId};
pub use traceback::{Frame, MAX_FRAMES, Traceback};
