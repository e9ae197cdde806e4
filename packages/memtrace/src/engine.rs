use std::cell::Cell;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use record_pool::PoolError;
use record_table::{compact_into, KeyOps, RecordTable, TablePool};
use smallvec::SmallVec;

use crate::error::ConfigError;
use crate::filters::{self, Filter};
use crate::intern::{Interner, filename_hash};
use crate::snapshot::{LineStat, TracedAllocation};
use crate::stack::StackProvider;
use crate::tasks::{Task, TaskCallback, TaskId, TaskList};
use crate::traceback::{Frame, MAX_FRAMES, Traceback};

/// Default number of frames captured per allocation.
const DEFAULT_FRAME_LIMIT: usize = 1;

/// Filename of the sentinel frame used when no stack is available.
const UNKNOWN_FILENAME: &str = "<unknown>";

thread_local! {
    /// While set, allocation events on this thread pass through untracked.
    static TRACKING_SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// Arms the reentrancy guard for a hook, or reports that the current thread
/// is already inside one.
fn suppress_tracking() -> Option<impl Drop> {
    if TRACKING_SUPPRESSED.get() {
        return None;
    }

    TRACKING_SUPPRESSED.set(true);
    Some(scopeguard::guard((), |()| TRACKING_SUPPRESSED.set(false)))
}

/// Runs `f` with tracking suppressed on this thread, restoring the previous
/// state afterwards.
///
/// Queries and maintenance allocate while holding engine locks; without the
/// guard those allocations would re-enter the hooks and deadlock when the
/// engine also serves as the process allocator.
fn with_suppressed<R>(f: impl FnOnce() -> R) -> R {
    let previous = TRACKING_SUPPRESSED.replace(true);
    let _restore = scopeguard::guard(previous, |previous| TRACKING_SUPPRESSED.set(previous));
    f()
}

/// Hashes raw allocation addresses; the low bits are alignment zeros, so
/// they are rotated out.
#[derive(Clone, Debug)]
struct AddressOps;

impl KeyOps<usize> for AddressOps {
    fn hash_key(&self, key: &usize) -> u64 {
        (*key as u64).rotate_right(4)
    }

    fn keys_equal(&self, a: &usize, b: &usize) -> bool {
        a == b
    }
}

/// Hashes interned filename handles by identity.
#[derive(Clone, Debug)]
struct HandleOps;

impl KeyOps<Arc<str>> for HandleOps {
    fn hash_key(&self, key: &Arc<str>) -> u64 {
        (Arc::as_ptr(key).cast::<u8>() as usize as u64).rotate_right(4)
    }

    fn keys_equal(&self, a: &Arc<str>, b: &Arc<str>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

#[derive(Clone, Debug)]
struct LineOps;

impl KeyOps<u32> for LineOps {
    fn hash_key(&self, key: &u32) -> u64 {
        u64::from(*key)
    }

    fn keys_equal(&self, a: &u32, b: &u32) -> bool {
        a == b
    }
}

/// One live allocation: its size and the interned stack that made it.
#[derive(Clone, Debug)]
struct Trace {
    size: usize,
    traceback: Arc<Traceback>,
}

/// Running totals for one source line.
#[derive(Clone, Copy, Debug)]
struct LineTotals {
    size: usize,
    count: usize,
}

type LineTable = RecordTable<u32, LineTotals, LineOps>;

/// The live-trace table and the nested file/line statistics tables,
/// guarded together by the engine's inner lock.
struct TraceTables {
    trace_pool: TablePool<usize, Trace>,
    traces: RecordTable<usize, Trace, AddressOps>,

    file_pool: TablePool<Arc<str>, LineTable>,
    files: RecordTable<Arc<str>, LineTable, HandleOps>,

    /// Shared by every per-file line table.
    line_pool: TablePool<u32, LineTotals>,
}

impl TraceTables {
    fn new() -> Result<Self, PoolError> {
        Ok(Self {
            trace_pool: TablePool::new(),
            traces: RecordTable::new(AddressOps)?,
            file_pool: TablePool::new(),
            files: RecordTable::new(HandleOps)?,
            line_pool: TablePool::new(),
        })
    }

    /// Records a trace and its statistics, or neither.
    fn insert_trace(
        &mut self,
        address: usize,
        size: usize,
        traceback: Arc<Traceback>,
    ) -> Result<(), PoolError> {
        match self.trace_pool.reserve(1) {
            Err(PoolError::CompactionRequired) => {
                compact_into(&mut self.trace_pool, &mut [&mut self.traces], 1)?;
            }
            result => result?,
        }

        let frame = traceback.top_frame().clone();
        self.traces
            .insert(&mut self.trace_pool, address, Trace { size, traceback })?;

        if let Err(error) = self.bump_stats(&frame, size) {
            // Keep the live-trace and statistics tables consistent with
            // each other: an allocation is tracked in both or in neither.
            _ = self.traces.pop(&mut self.trace_pool, &address);
            return Err(error);
        }

        Ok(())
    }

    /// Removes the trace for `address`, with its statistics contribution.
    fn pop_trace(&mut self, address: usize) -> Option<Trace> {
        let trace = self.traces.pop(&mut self.trace_pool, &address)?;
        self.remove_stat(trace.traceback.top_frame(), trace.size);

        if self.trace_pool.should_defragment() {
            _ = compact_into(&mut self.trace_pool, &mut [&mut self.traces], 0);
        }

        Some(trace)
    }

    fn ensure_file_entry(&mut self, filename: &Arc<str>) -> Result<(), PoolError> {
        if self.files.get(&self.file_pool, filename).is_some() {
            return Ok(());
        }

        let line_table = LineTable::new(LineOps)?;

        match self.file_pool.reserve(1) {
            Err(PoolError::CompactionRequired) => {
                compact_into(&mut self.file_pool, &mut [&mut self.files], 1)?;
            }
            result => result?,
        }

        self.files
            .insert(&mut self.file_pool, Arc::clone(filename), line_table)
    }

    fn bump_stats(&mut self, frame: &Frame, size: usize) -> Result<(), PoolError> {
        self.ensure_file_entry(&frame.filename)?;

        {
            let Self {
                file_pool,
                files,
                line_pool,
                ..
            } = self;
            let line_table = files
                .get_mut(file_pool, &frame.filename)
                .expect("file entry ensured above");

            if let Some(totals) = line_table.get_mut(line_pool, &frame.lineno) {
                totals.size = totals.size.saturating_add(size);
                totals.count = totals.count.saturating_add(1);
                return Ok(());
            }
        }

        // A new line record is needed; make room up front so the insert
        // cannot fail halfway.
        match self.line_pool.reserve(1) {
            Err(PoolError::CompactionRequired) => self.compact_line_pool(1)?,
            result => result?,
        }

        let Self {
            file_pool,
            files,
            line_pool,
            ..
        } = self;
        let line_table = files
            .get_mut(file_pool, &frame.filename)
            .expect("file entry ensured above");
        line_table.insert(line_pool, frame.lineno, LineTotals { size, count: 1 })
    }

    fn remove_stat(&mut self, frame: &Frame, size: usize) {
        {
            let Self {
                file_pool,
                files,
                line_pool,
                ..
            } = self;

            let Some(line_table) = files.get_mut(file_pool, &frame.filename) else {
                debug_assert!(false, "live trace without a statistics entry");
                return;
            };

            let Some(totals) = line_table.get_mut(line_pool, &frame.lineno) else {
                debug_assert!(false, "live trace without a statistics entry");
                return;
            };

            totals.size = totals.size.saturating_sub(size);
            totals.count = totals.count.saturating_sub(1);
            let line_drained = totals.count == 0;

            if line_drained {
                line_table.remove(line_pool, &frame.lineno);

                if line_table.is_empty() {
                    // Releases the statistics' filename handle; the
                    // interning table keeps its own.
                    _ = files.pop(file_pool, &frame.filename);
                }
            }
        }

        if self.line_pool.should_defragment() {
            _ = self.compact_line_pool(0);
        }
        if self.file_pool.should_defragment() {
            _ = compact_into(&mut self.file_pool, &mut [&mut self.files], 0);
        }
    }

    /// Compacts the shared line pool.
    ///
    /// The line tables live inside file records, so they are lifted out,
    /// re-homed together into a fresh pool and put back. When putting one
    /// back fails, that file's statistics are dropped; its line records were
    /// already re-homed and are released with the table.
    fn compact_line_pool(&mut self, extra_capacity: usize) -> Result<(), PoolError> {
        let mut filenames = Vec::with_capacity(self.files.len());
        _ = self.files.for_each(&self.file_pool, |filename, _| {
            filenames.push(Arc::clone(filename));
            ControlFlow::<()>::Continue(())
        });

        let mut lifted = Vec::with_capacity(filenames.len());
        for filename in filenames {
            let table = self
                .files
                .pop(&mut self.file_pool, &filename)
                .expect("filename was listed above");
            lifted.push((filename, table));
        }

        let result = {
            let mut tables: Vec<&mut LineTable> =
                lifted.iter_mut().map(|(_, table)| table).collect();
            compact_into(&mut self.line_pool, &mut tables, extra_capacity)
        };

        for (filename, mut table) in lifted {
            if self.file_pool.reserve(1).is_ok() {
                self.files
                    .insert(&mut self.file_pool, filename, table)
                    .expect("capacity reserved above");
            } else {
                tracing::debug!(file = %filename, "per-file statistics dropped during compaction");
                table.clear(&mut self.line_pool);
            }
        }

        result
    }

    /// Releases every trace, every statistic and all their arenas.
    fn clear(&mut self) {
        self.traces.clear(&mut self.trace_pool);
        self.trace_pool.clear();

        let mut filenames = Vec::with_capacity(self.files.len());
        _ = self.files.for_each(&self.file_pool, |filename, _| {
            filenames.push(Arc::clone(filename));
            ControlFlow::<()>::Continue(())
        });
        for filename in filenames {
            if let Some(mut line_table) = self.files.pop(&mut self.file_pool, &filename) {
                line_table.clear(&mut self.line_pool);
            }
        }

        self.files.clear(&mut self.file_pool);
        self.file_pool.clear();
        self.line_pool.clear();
    }
}

/// State under the engine's outer lock: capture, interning, filters, tasks.
struct SharedState {
    frame_limit: usize,
    provider: Box<dyn StackProvider>,
    interner: Interner,
    filters: Vec<Filter>,
    tasks: TaskList,

    /// Shared sentinel stack for allocations with no capturable frames.
    empty_traceback: Arc<Traceback>,
}

/// Captures, interns and filters the current call stack.
///
/// `Ok(None)` means the filter set rejected the allocation.
fn capture(shared: &mut SharedState) -> Result<Option<Arc<Traceback>>, PoolError> {
    let SharedState {
        frame_limit,
        provider,
        interner,
        filters,
        empty_traceback,
        ..
    } = shared;

    let limit = (*frame_limit).min(MAX_FRAMES);
    let mut frames: SmallVec<[Frame; 8]> = SmallVec::new();
    if limit > 0 {
        for raw in provider.capture(limit).into_iter().take(limit) {
            frames.push(Frame {
                filename: interner.intern_filename(&raw.filename)?,
                lineno: raw.lineno,
            });
        }
    }

    if frames.is_empty() {
        // A missing stack is unmatched by every pattern: include filters
        // fail it and exclude filters pass it, wildcards included.
        if !filters::allows(filters, &[]) {
            return Ok(None);
        }
        return Ok(Some(Arc::clone(empty_traceback)));
    }

    if !filters::allows(filters, &frames) {
        return Ok(None);
    }

    interner.intern_traceback(&frames).map(Some)
}

/// The allocation-tracking engine.
///
/// One engine tracks one allocation domain: an interposition layer calls
/// [`on_alloc`](Self::on_alloc) / [`on_realloc`](Self::on_realloc) /
/// [`on_free`](Self::on_free) around every operation it performs, and the
/// engine maintains a live-trace table keyed by address, per-source-line
/// statistics, and cumulative traced-memory counters. Call stacks come from
/// the [`StackProvider`] given at construction and are interned, so repeated
/// allocations from the same site cost one handle clone.
///
/// # Locking
///
/// Two locks split the state: an outer lock serializes capture, interning,
/// filters and the task list; an inner lock protects the live-trace and
/// statistics tables with minimal critical sections. Neither lock is ever
/// held across a task callback. A thread-local reentrancy flag makes the
/// hooks safe to call from within the engine's own internal allocations.
///
/// Hooks never report errors: an allocation that cannot be tracked (out of
/// memory, filtered out) is simply not recorded.
pub struct TraceEngine {
    tracing: AtomicBool,

    /// Updated under the inner lock, readable lock-free.
    traced_current: AtomicUsize,
    traced_peak: AtomicUsize,

    shared: Mutex<SharedState>,
    tables: Mutex<TraceTables>,
}

impl TraceEngine {
    /// Creates a disabled engine that captures stacks through `provider`.
    ///
    /// The default frame limit is 1: only the innermost frame is kept.
    pub fn new(provider: Box<dyn StackProvider>) -> Result<Self, PoolError> {
        let sentinel_frame = Frame {
            filename: Arc::from(UNKNOWN_FILENAME),
            lineno: 0,
        };
        let empty_traceback = Arc::new(Traceback::new(
            vec![sentinel_frame].into_boxed_slice(),
            filename_hash,
        ));

        Ok(Self {
            tracing: AtomicBool::new(false),
            traced_current: AtomicUsize::new(0),
            traced_peak: AtomicUsize::new(0),
            shared: Mutex::new(SharedState {
                frame_limit: DEFAULT_FRAME_LIMIT,
                provider,
                interner: Interner::new()?,
                filters: Vec::new(),
                tasks: TaskList::new(),
                empty_traceback,
            }),
            tables: Mutex::new(TraceTables::new()?),
        })
    }

    fn lock_shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().expect("engine state lock poisoned")
    }

    fn lock_tables(&self) -> MutexGuard<'_, TraceTables> {
        self.tables.lock().expect("engine tables lock poisoned")
    }

    /// Whether allocation events are currently being recorded.
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::SeqCst)
    }

    /// Starts recording allocation events. Idempotent.
    pub fn enable(&self) {
        self.tracing.store(true, Ordering::SeqCst);
    }

    /// Stops recording and releases all tracked and interned state.
    ///
    /// The single cancellation primitive: drains the task list, clears every
    /// table and resets the traced-memory counters. Safe to call at
    /// exit-time teardown and from any thread.
    pub fn disable(&self) {
        self.tracing.store(false, Ordering::SeqCst);

        with_suppressed(|| {
            let mut shared = self.lock_shared();
            shared.tasks.clear();
            shared.interner.clear();

            let mut tables = self.lock_tables();
            tables.clear();
            self.traced_current.store(0, Ordering::Relaxed);
            self.traced_peak.store(0, Ordering::Relaxed);
        });
    }

    // ----- allocator hook surface -----

    /// Reports an allocation of `size` bytes at `address`.
    pub fn on_alloc(&self, address: usize, size: usize) {
        if address == 0 || !self.is_tracing() {
            return;
        }
        let Some(pending) = self.track_alloc(address, size) else {
            return;
        };
        self.run_pending(pending);
    }

    /// Reports that the allocation at `address` was freed.
    ///
    /// Frees of untracked or filtered-out allocations are silently ignored.
    pub fn on_free(&self, address: usize) {
        if address == 0 || !self.is_tracing() {
            return;
        }
        let Some(pending) = self.track_free(address) else {
            return;
        };
        self.run_pending(pending);
    }

    /// Reports a reallocation: the trace moves from `old_address` to
    /// `new_address` with the new size and a freshly captured stack.
    ///
    /// Tolerates an untracked `old_address`, which happens when the original
    /// allocation was filtered out or made before tracking started.
    pub fn on_realloc(&self, old_address: usize, new_address: usize, size: usize) {
        if !self.is_tracing() {
            return;
        }
        let Some(pending) = self.track_realloc(old_address, new_address, size) else {
            return;
        };
        self.run_pending(pending);
    }

    fn track_alloc(&self, address: usize, size: usize) -> Option<Vec<(TaskId, TaskCallback)>> {
        let _suppress = suppress_tracking()?;

        let mut shared = self.lock_shared();
        match capture(&mut shared) {
            Ok(Some(traceback)) => {
                let mut tables = self.lock_tables();
                self.record(&mut tables, address, size, traceback);
            }
            Ok(None) => {}
            Err(error) => tracing::debug!(%error, "allocation not tracked"),
        }

        let traced = self.traced_current.load(Ordering::Relaxed);
        Some(shared.tasks.take_due(traced, Instant::now()))
    }

    fn track_free(&self, address: usize) -> Option<Vec<(TaskId, TaskCallback)>> {
        let _suppress = suppress_tracking()?;

        {
            let mut tables = self.lock_tables();
            if let Some(trace) = tables.pop_trace(address) {
                self.sub_traced(trace.size);
            }
        }

        let mut shared = self.lock_shared();
        let traced = self.traced_current.load(Ordering::Relaxed);
        Some(shared.tasks.take_due(traced, Instant::now()))
    }

    fn track_realloc(
        &self,
        old_address: usize,
        new_address: usize,
        size: usize,
    ) -> Option<Vec<(TaskId, TaskCallback)>> {
        let _suppress = suppress_tracking()?;

        let mut shared = self.lock_shared();
        let captured = capture(&mut shared);
        {
            let mut tables = self.lock_tables();
            if old_address != 0 {
                if let Some(trace) = tables.pop_trace(old_address) {
                    self.sub_traced(trace.size);
                }
            }
            if new_address != 0 {
                match captured {
                    Ok(Some(traceback)) => self.record(&mut tables, new_address, size, traceback),
                    Ok(None) => {}
                    Err(error) => tracing::debug!(%error, "reallocation not tracked"),
                }
            }
        }

        let traced = self.traced_current.load(Ordering::Relaxed);
        Some(shared.tasks.take_due(traced, Instant::now()))
    }

    /// Records one tracked allocation under the inner lock.
    fn record(&self, tables: &mut TraceTables, address: usize, size: usize, traceback: Arc<Traceback>) {
        // A stale trace at the same address means the underlying allocator
        // reused it without the free being reported; replace it.
        if let Some(stale) = tables.pop_trace(address) {
            self.sub_traced(stale.size);
        }

        match tables.insert_trace(address, size, traceback) {
            Ok(()) => self.add_traced(size),
            Err(error) => tracing::debug!(%error, "allocation not tracked"),
        }
    }

    fn add_traced(&self, size: usize) {
        let current = self
            .traced_current
            .fetch_add(size, Ordering::Relaxed)
            .saturating_add(size);
        self.traced_peak.fetch_max(current, Ordering::Relaxed);
    }

    fn sub_traced(&self, size: usize) {
        _ = self
            .traced_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Runs fired task callbacks outside every lock and outside the
    /// reentrancy guard, then reports their outcomes back to the list.
    fn run_pending(&self, pending: Vec<(TaskId, TaskCallback)>) {
        for (id, mut callback) in pending {
            let result = callback();
            if let Err(error) = &result {
                tracing::error!(task = ?id, %error, "scheduled task callback failed");
            }

            let mut shared = self.lock_shared();
            let traced = self.traced_current.load(Ordering::Relaxed);
            shared
                .tasks
                .finish(id, callback, result.is_err(), traced, Instant::now());
        }
    }

    // ----- query surface -----

    /// Current and peak traced memory in bytes.
    #[must_use]
    pub fn traced_memory(&self) -> (usize, usize) {
        (
            self.traced_current.load(Ordering::Relaxed),
            self.traced_peak.load(Ordering::Relaxed),
        )
    }

    /// Snapshot of every live traced allocation.
    ///
    /// The shared tables are copied under the inner lock and materialized
    /// lock-free, bounding how long other threads are held up.
    pub fn traces(&self) -> Result<Vec<TracedAllocation>, PoolError> {
        with_suppressed(|| {
            let (pool, copy) = {
                let tables = self.lock_tables();
                let mut pool = TablePool::new();
                let copy = tables.traces.copy_with(&tables.trace_pool, &mut pool, |trace| {
                    Ok::<_, PoolError>(trace.clone())
                })?;
                (pool, copy)
            };

            let mut result = Vec::with_capacity(copy.len());
            _ = copy.for_each(&pool, |address, trace| {
                result.push(TracedAllocation {
                    address: *address,
                    size: trace.size,
                    traceback: Arc::clone(&trace.traceback),
                });
                ControlFlow::<()>::Continue(())
            });
            Ok(result)
        })
    }

    /// The trace for one address, if it is live and tracked.
    #[must_use]
    pub fn trace(&self, address: usize) -> Option<TracedAllocation> {
        with_suppressed(|| {
            let tables = self.lock_tables();
            tables
                .traces
                .get(&tables.trace_pool, &address)
                .map(|trace| TracedAllocation {
                    address,
                    size: trace.size,
                    traceback: Arc::clone(&trace.traceback),
                })
        })
    }

    /// Snapshot of the per-source-line statistics.
    pub fn stats(&self) -> Result<Vec<LineStat>, PoolError> {
        with_suppressed(|| {
            let (file_pool, line_pool, copy) = {
                let tables = self.lock_tables();
                let mut file_pool = TablePool::new();
                let mut line_pool = TablePool::new();
                let copy = tables
                    .files
                    .copy_with(&tables.file_pool, &mut file_pool, |line_table| {
                        line_table.copy_with(&tables.line_pool, &mut line_pool, |totals| {
                            Ok::<_, PoolError>(*totals)
                        })
                    })?;
                (file_pool, line_pool, copy)
            };

            let mut result = Vec::new();
            _ = copy.for_each(&file_pool, |filename, line_table| {
                _ = line_table.for_each(&line_pool, |lineno, totals| {
                    result.push(LineStat {
                        filename: Arc::clone(filename),
                        lineno: *lineno,
                        size: totals.size,
                        count: totals.count,
                    });
                    ControlFlow::<()>::Continue(())
                });
                ControlFlow::<()>::Continue(())
            });
            Ok(result)
        })
    }

    /// Forgets every tracked allocation and interned value; tracking itself
    /// stays in its current state.
    pub fn clear_traces(&self) {
        with_suppressed(|| {
            let mut shared = self.lock_shared();
            shared.interner.clear();

            let mut tables = self.lock_tables();
            tables.clear();
            self.traced_current.store(0, Ordering::Relaxed);
            self.traced_peak.store(0, Ordering::Relaxed);
        });
    }

    // ----- configuration -----

    /// Number of frames captured per allocation.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into a lying accessor.
    pub fn frame_limit(&self) -> usize {
        self.lock_shared().frame_limit
    }

    /// Sets the number of frames captured per allocation (`0..=100`).
    ///
    /// A limit of 0 attributes every allocation to the sentinel stack. The
    /// change is not retroactive: already-interned tracebacks keep their
    /// depth.
    pub fn set_frame_limit(&self, limit: usize) -> Result<(), ConfigError> {
        if limit > MAX_FRAMES {
            return Err(ConfigError::FrameLimitTooLarge(limit));
        }
        self.lock_shared().frame_limit = limit;
        Ok(())
    }

    /// Appends a filter to the active set.
    pub fn add_filter(&self, filter: Filter) {
        self.lock_shared().filters.push(filter);
    }

    /// The active filter set, in evaluation order.
    #[must_use]
    pub fn filters(&self) -> Vec<Filter> {
        self.lock_shared().filters.clone()
    }

    /// Removes every filter; everything is recorded again.
    pub fn clear_filters(&self) {
        self.lock_shared().filters.clear();
    }

    // ----- task surface -----

    /// Schedules a task; it arms immediately against the current time and
    /// traced-memory value.
    pub fn schedule_task(&self, task: Task) -> Result<TaskId, ConfigError> {
        let mut shared = self.lock_shared();
        let traced = self.traced_current.load(Ordering::Relaxed);
        shared.tasks.schedule(task, traced, Instant::now())
    }

    /// Cancels a task in any state; reports whether it was scheduled.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.lock_shared().tasks.cancel(id)
    }

    /// Whether a task is still in the list, in any state.
    #[must_use]
    pub fn is_task_scheduled(&self, id: TaskId) -> bool {
        self.lock_shared().tasks.is_scheduled(id)
    }

    /// Handles of every scheduled task.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskId> {
        self.lock_shared().tasks.ids()
    }

    /// Updates a task's delay, re-arming it if it is armed. Reports whether
    /// the task was found.
    pub fn set_task_delay(&self, id: TaskId, delay: Duration) -> Result<bool, ConfigError> {
        let mut shared = self.lock_shared();
        let traced = self.traced_current.load(Ordering::Relaxed);
        shared.tasks.set_delay(id, delay, traced, Instant::now())
    }

    /// Updates a task's memory threshold, re-arming it if it is armed.
    /// Reports whether the task was found.
    pub fn set_task_memory_threshold(&self, id: TaskId, bytes: usize) -> Result<bool, ConfigError> {
        let mut shared = self.lock_shared();
        let traced = self.traced_current.load(Ordering::Relaxed);
        shared
            .tasks
            .set_memory_threshold(id, bytes, traced, Instant::now())
    }
}

impl Drop for TraceEngine {
    fn drop(&mut self) {
        // The tables and interner are released by the field drops; stop the
        // hooks first so a racing caller observes a disabled engine.
        self.tracing.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for TraceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut state = f.debug_struct("TraceEngine");
        state
            .field("tracing", &self.is_tracing())
            .field("traced_current", &self.traced_current.load(Ordering::Relaxed))
            .field("traced_peak", &self.traced_peak.load(Ordering::Relaxed));

        if let Ok(tables) = self.tables.try_lock() {
            state
                .field("live_traces", &tables.traces.len())
                .field("trace_pool_used", &tables.trace_pool.used())
                .field("trace_pool_arenas", &tables.trace_pool.arena_count())
                .field("tracked_files", &tables.files.len());
        }
        if let Ok(shared) = self.shared.try_lock() {
            state
                .field("interned_filenames", &shared.interner.filename_count())
                .field("interned_tracebacks", &shared.interner.traceback_count())
                .field("filters", &shared.filters.len())
                .field("tasks", &shared.tasks);
        }

        state.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::stack::{FnProvider, FrameBuffer, SourceFrame};

    assert_impl_all!(TraceEngine: Send, Sync);

    fn fixed_engine(filename: &'static str, lineno: u32) -> TraceEngine {
        let provider = FnProvider::new(move |limit| {
            let mut frames = FrameBuffer::new();
            if limit > 0 {
                frames.push(SourceFrame {
                    filename: String::from(filename),
                    lineno,
                });
            }
            frames
        });
        let engine = TraceEngine::new(Box::new(provider)).unwrap();
        engine.enable();
        engine
    }

    #[test]
    fn disabled_engine_ignores_events() {
        let engine = fixed_engine("a.py", 1);
        engine.disable();

        engine.on_alloc(0x1000, 100);
        assert_eq!(engine.traced_memory(), (0, 0));
        assert!(engine.traces().unwrap().is_empty());
    }

    #[test]
    fn alloc_free_round_trip() {
        let engine = fixed_engine("a.py", 1);

        engine.on_alloc(0x1000, 100);
        assert_eq!(engine.traced_memory(), (100, 100));
        assert_eq!(engine.stats().unwrap().len(), 1);

        engine.on_free(0x1000);
        assert_eq!(engine.traced_memory(), (0, 100));
        assert!(engine.stats().unwrap().is_empty());
        assert!(engine.traces().unwrap().is_empty());
    }

    #[test]
    fn reused_address_replaces_the_stale_trace() {
        let engine = fixed_engine("a.py", 1);

        engine.on_alloc(0x1000, 100);
        engine.on_alloc(0x1000, 40);

        assert_eq!(engine.traced_memory().0, 40);
        assert_eq!(engine.trace(0x1000).unwrap().size, 40);
        assert_eq!(engine.traces().unwrap().len(), 1);
    }

    #[test]
    fn realloc_moves_the_trace() {
        let engine = fixed_engine("a.py", 1);

        engine.on_alloc(0x1000, 100);
        engine.on_realloc(0x1000, 0x2000, 150);

        assert_eq!(engine.traced_memory().0, 150);
        assert!(engine.trace(0x1000).is_none());
        assert_eq!(engine.trace(0x2000).unwrap().size, 150);

        // An untracked old address is tolerated.
        engine.on_realloc(0x9000, 0x3000, 10);
        assert_eq!(engine.traced_memory().0, 160);
    }

    #[test]
    fn zero_frame_limit_uses_the_sentinel_stack() {
        let engine = fixed_engine("a.py", 1);
        engine.set_frame_limit(0).unwrap();

        engine.on_alloc(0x1000, 25);

        let trace = engine.trace(0x1000).unwrap();
        assert_eq!(&*trace.traceback.top_frame().filename, "<unknown>");
        assert_eq!(trace.traceback.top_frame().lineno, 0);

        let stats = engine.stats().unwrap();
        assert_eq!(&*stats[0].filename, "<unknown>");
    }

    #[test]
    fn frame_limit_is_validated() {
        let engine = fixed_engine("a.py", 1);

        assert_eq!(
            engine.set_frame_limit(MAX_FRAMES + 1),
            Err(ConfigError::FrameLimitTooLarge(MAX_FRAMES + 1))
        );
        engine.set_frame_limit(MAX_FRAMES).unwrap();
        assert_eq!(engine.frame_limit(), MAX_FRAMES);
    }

    #[test]
    fn clear_traces_resets_counters_but_not_tracing() {
        let engine = fixed_engine("a.py", 1);

        engine.on_alloc(0x1000, 100);
        engine.clear_traces();

        assert_eq!(engine.traced_memory(), (0, 0));
        assert!(engine.is_tracing());
        assert!(engine.traces().unwrap().is_empty());

        // The stale trace for the cleared address is gone; re-allocation
        // tracks fresh.
        engine.on_alloc(0x1000, 50);
        assert_eq!(engine.traced_memory(), (50, 50));
    }

    #[test]
    fn null_address_is_ignored() {
        let engine = fixed_engine("a.py", 1);

        engine.on_alloc(0, 100);
        engine.on_free(0);
        assert_eq!(engine.traced_memory(), (0, 0));
    }
}
