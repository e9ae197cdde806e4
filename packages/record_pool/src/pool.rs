use std::mem::size_of;

use thiserror::Error;

use crate::{Arena, Slot};

/// Hard cap on the number of simultaneous arenas in one pool.
///
/// Chosen to bound the cost of the per-arena scans performed on allocation and
/// release; once reached, further growth requires compacting the records into
/// fewer arenas.
pub const MAX_ARENAS: usize = 32;

/// Fragmentation tolerated before growth or maintenance asks for compaction.
/// Chosen as a cpu/memory compromise.
const MAX_FRAGMENTATION: f64 = 0.50;

/// Default byte floor for a freshly allocated arena, chosen to limit the
/// number of memory mappings per process without wasting too much memory.
const ARENA_MIN_BYTES: usize = 128 * 1024;

/// A stable handle to a record in a [`RecordPool`].
///
/// Keys stay valid until the record is removed, including across the removal
/// of other (empty) arenas. Keys may be reused by the pool after their record
/// is removed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RecordKey {
    pub(crate) arena: u32,
    pub(crate) slot: u32,
}

/// Errors reported by [`RecordPool`] operations.
///
/// Both variants are recoverable: the pool stays usable, the requested record
/// simply was not produced.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum PoolError {
    /// The underlying memory for a new arena could not be allocated.
    #[error("out of memory while growing the record pool")]
    OutOfMemory,

    /// The pool is at its arena limit or its fragmentation budget; the owner
    /// of the record keys must rebuild the pool before it can grow further.
    #[error("record pool requires compaction before it can grow")]
    CompactionRequired,
}

/// An ordered collection of up to [`MAX_ARENAS`] arenas sharing one record
/// type.
///
/// Records are inserted into the most recently added arena first, so older
/// arenas drain over time and can be reclaimed. Growth sizes new arenas with
/// a fragmentation-aware formula: the new arena covers at least the shortfall
/// of the reservation, at least the configured byte floor, and enough slack
/// that the pool's overall fragmentation stays inside the tolerance after
/// repeated small reservations.
///
/// The pool stores only bookkeeping metadata for its owner; it is not a
/// general-purpose allocator and never stores user payloads.
#[derive(Debug)]
pub struct RecordPool<T> {
    arenas: Vec<Arena<T>>,

    /// Arena ids are never reused within one pool, so keys into a removed
    /// arena cannot alias a live record.
    next_arena_id: u32,

    /// Total slot count across all arenas.
    length: usize,

    /// Occupied slot count across all arenas.
    used: usize,

    min_arena_bytes: usize,
}

impl<T> RecordPool<T> {
    /// Creates an empty pool with the default arena byte floor (128 KiB).
    #[must_use]
    pub fn new() -> Self {
        Self::with_min_arena_bytes(ARENA_MIN_BYTES)
    }

    /// Creates an empty pool with a custom arena byte floor.
    ///
    /// Smaller floors trade mapping churn for lower idle memory; the default
    /// of [`RecordPool::new()`] is right for allocation-tracker workloads.
    #[must_use]
    pub fn with_min_arena_bytes(min_arena_bytes: usize) -> Self {
        assert!(size_of::<T>() > 0, "RecordPool does not support zero-sized records");

        Self {
            arenas: Vec::new(),
            next_arena_id: 0,
            length: 0,
            used: 0,
            min_arena_bytes: min_arena_bytes.max(size_of::<Slot<T>>()),
        }
    }

    /// Creates a pool with capacity reserved for `items` records up front.
    ///
    /// Used when rebuilding a fragmented pool: the new pool is sized to the
    /// live record count plus the requested growth, in one arena.
    pub fn with_reserved(items: usize, min_arena_bytes: usize) -> Result<Self, PoolError> {
        let mut pool = Self::with_min_arena_bytes(min_arena_bytes);
        if items > 0 {
            pool.reserve(items)?;
        }
        Ok(pool)
    }

    /// Total number of record slots across all arenas.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into unbounded growth.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Number of live records.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of vacant slots.
    #[must_use]
    pub fn free(&self) -> usize {
        self.length
            .checked_sub(self.used)
            .expect("used never exceeds length")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of arenas currently backing the pool.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// The byte floor used when sizing new arenas.
    #[must_use]
    pub fn min_arena_bytes(&self) -> usize {
        self.min_arena_bytes
    }

    fn record_bytes() -> usize {
        size_of::<Slot<T>>()
    }

    /// Minimum viable arena length, derived from the byte floor.
    fn min_arena_items(&self) -> usize {
        (self.min_arena_bytes / Self::record_bytes()).max(1)
    }

    /// Stores `value` in the pool and returns its key.
    ///
    /// Scans arenas newest-first; when every arena is full, grows the pool by
    /// one reservation. Growth can fail with [`PoolError::OutOfMemory`] or
    /// with [`PoolError::CompactionRequired`] when the pool has hit its arena
    /// limit or fragmentation budget.
    pub fn insert(&mut self, value: T) -> Result<RecordKey, PoolError> {
        let mut value = value;
        for arena in self.arenas.iter_mut().rev() {
            match arena.insert(value) {
                Ok(slot) => {
                    self.used = self
                        .used
                        .checked_add(1)
                        .expect("used is bounded by length");
                    return Ok(RecordKey {
                        arena: arena.id(),
                        slot,
                    });
                }
                Err(rejected) => value = rejected,
            }
        }

        self.reserve(1)?;

        let arena = self
            .arenas
            .last_mut()
            .expect("reserve adds an arena when the pool is full");
        let slot = match arena.insert(value) {
            Ok(slot) => slot,
            Err(_) => unreachable!("freshly reserved arena cannot be full"),
        };

        self.used = self
            .used
            .checked_add(1)
            .expect("used is bounded by length");
        Ok(RecordKey {
            arena: arena.id(),
            slot,
        })
    }

    /// Ensures at least `items` records can be inserted without further
    /// growth.
    ///
    /// A new arena is sized to the larger of the reservation shortfall and
    /// the minimum viable arena length, inflated so repeated small
    /// reservations do not force an arena per reservation. Reports
    /// [`PoolError::CompactionRequired`] when the pool is at [`MAX_ARENAS`]
    /// or when adding the arena would push fragmentation past the tolerance.
    pub fn reserve(&mut self, items: usize) -> Result<(), PoolError> {
        if items <= self.free() {
            return Ok(());
        }

        if self.arenas.len() == MAX_ARENAS {
            return Err(PoolError::CompactionRequired);
        }

        let mut arena_length = items
            .checked_sub(self.free())
            .expect("guarded by the free-capacity check above");

        // Size the arena so that post-growth utilization lands near
        // 1 - MAX_FRAGMENTATION / 2, leaving headroom for the next
        // reservations without tipping the pool into its fragmentation
        // budget.
        let factor = 1.0 - MAX_FRAGMENTATION / 2.0;
        let target =
            (self.used + items) as f64 - self.length as f64 * factor;
        if target > 0.0 {
            let inflated = (target / factor) as usize;
            arena_length = arena_length.max(inflated);
        }

        arena_length = arena_length.max(self.min_arena_items());

        // Growing a pool that is already reasonably sized must not increase
        // fragmentation past the tolerance; the threshold is expressed in
        // bytes so record size does not skew it.
        if !self.arenas.is_empty() {
            let new_length = self
                .length
                .checked_add(arena_length)
                .expect("pool length cannot overflow usize");
            let narena = self.arenas.len() + 1;
            let avg_arena_bytes = new_length * Self::record_bytes() / narena;

            if avg_arena_bytes > self.min_arena_bytes {
                let free_after = new_length - self.used - items;
                if free_after as f64 > MAX_FRAGMENTATION * new_length as f64 {
                    return Err(PoolError::CompactionRequired);
                }
            }
        }

        self.push_arena(arena_length)
    }

    fn push_arena(&mut self, arena_length: usize) -> Result<(), PoolError> {
        debug_assert!(self.arenas.len() < MAX_ARENAS);

        self.arenas
            .try_reserve(1)
            .map_err(|_| PoolError::OutOfMemory)?;

        let id = self.next_arena_id;
        self.next_arena_id = self
            .next_arena_id
            .checked_add(1)
            .expect("arena ids cannot be exhausted in practice");

        let arena = Arena::new(id, arena_length)?;
        self.length = self
            .length
            .checked_add(arena.len())
            .expect("pool length cannot overflow usize");
        self.arenas.push(arena);
        Ok(())
    }

    /// Removes the record for `key` and returns it.
    ///
    /// If the record's arena becomes empty it is reclaimed, unless it is the
    /// pool's last arena or the rest of the pool is fully utilized (removing
    /// it would leave no slack at all).
    ///
    /// # Panics
    ///
    /// Panics if `key` does not refer to a live record.
    pub fn remove(&mut self, key: RecordKey) -> T {
        let index = self
            .arena_index(key.arena)
            .expect("record key does not belong to this pool");

        let arena = self
            .arenas
            .get_mut(index)
            .expect("arena_index returns valid indices");
        let value = arena.remove(key.slot);

        self.used = self
            .used
            .checked_sub(1)
            .expect("a record was just removed so used was non-zero");

        if arena.is_empty() {
            self.maybe_remove_arena(index);
        }

        value
    }

    #[must_use]
    pub fn get(&self, key: RecordKey) -> Option<&T> {
        self.arena_index(key.arena)
            .and_then(|index| self.arenas.get(index))
            .and_then(|arena| arena.get(key.slot))
    }

    #[must_use]
    pub fn get_mut(&mut self, key: RecordKey) -> Option<&mut T> {
        let index = self.arena_index(key.arena)?;
        self.arenas.get_mut(index)?.get_mut(key.slot)
    }

    /// Drops every arena and every record still in them.
    pub fn clear(&mut self) {
        self.arenas.clear();
        self.length = 0;
        self.used = 0;
    }

    /// Whether maintenance should rebuild the pool into fewer arenas.
    ///
    /// True when the pool spans more than one reasonably sized arena (average
    /// arena size above the byte floor) and the observed fragmentation
    /// exceeds the tolerance. Small pools are never worth compacting.
    #[must_use]
    pub fn should_defragment(&self) -> bool {
        if self.arenas.len() <= 1 {
            return false;
        }

        let avg_arena_bytes = self.length * Self::record_bytes() / self.arenas.len();
        if avg_arena_bytes <= self.min_arena_bytes {
            return false;
        }

        self.free() as f64 > MAX_FRAGMENTATION * self.length as f64
    }

    fn arena_index(&self, arena_id: u32) -> Option<usize> {
        // At most MAX_ARENAS entries, a linear scan beats anything fancier.
        self.arenas.iter().position(|arena| arena.id() == arena_id)
    }

    fn maybe_remove_arena(&mut self, index: usize) {
        // Never remove the last arena.
        if self.arenas.len() == 1 {
            return;
        }

        let arena_length = self
            .arenas
            .get(index)
            .expect("caller passes a valid arena index")
            .len();

        // All remaining slack lives in this arena; keep it so the pool
        // retains room for the next insert.
        if self.used == self.length - arena_length {
            return;
        }

        debug_assert!(self.arenas[index].is_empty());

        let arena = self.arenas.remove(index);
        self.length = self
            .length
            .checked_sub(arena.len())
            .expect("arena length is included in pool length");
    }
}

impl<T> Default for RecordPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(RecordPool<u64>: Send, Sync);
    assert_impl_all!(RecordKey: Send, Sync);

    // Small arenas keep the tests fast; four records per arena.
    fn small_pool() -> RecordPool<u64> {
        RecordPool::with_min_arena_bytes(4 * size_of::<Slot<u64>>())
    }

    #[test]
    fn smoke_test() {
        let mut pool = RecordPool::<u64>::new();

        let a = pool.insert(42).unwrap();
        let b = pool.insert(43).unwrap();

        assert_eq!(pool.get(a), Some(&42));
        assert_eq!(pool.get(b), Some(&43));
        assert_eq!(pool.used(), 2);

        *pool.get_mut(a).unwrap() = 52;
        assert_eq!(pool.get(a), Some(&52));

        assert_eq!(pool.remove(a), 52);
        assert_eq!(pool.remove(b), 43);
        assert!(pool.is_empty());
    }

    #[test]
    fn keys_stay_valid_across_growth() {
        let mut pool = small_pool();

        let keys: Vec<_> = (0..100_u64).map(|v| pool.insert(v).unwrap()).collect();
        assert!(pool.arena_count() > 1);

        for (expected, key) in keys.iter().enumerate() {
            assert_eq!(pool.get(*key), Some(&(expected as u64)));
        }
    }

    #[test]
    fn reserve_is_noop_with_free_capacity() {
        let mut pool = small_pool();

        pool.reserve(4).unwrap();
        let arenas = pool.arena_count();
        let length = pool.len();

        pool.reserve(2).unwrap();
        assert_eq!(pool.arena_count(), arenas);
        assert_eq!(pool.len(), length);
    }

    #[test]
    fn empty_arenas_are_reclaimed_down_to_one() {
        let mut pool = small_pool();

        let keys: Vec<_> = (0..100_u64).map(|v| pool.insert(v).unwrap()).collect();
        assert!(pool.arena_count() > 2);

        // Keep a single survivor; every other arena empties and is removed.
        for key in &keys[1..] {
            pool.remove(*key);
        }

        assert_eq!(pool.used(), 1);
        assert_eq!(pool.arena_count(), 1);
        assert_eq!(pool.get(keys[0]), Some(&0));
    }

    #[test]
    fn last_arena_is_never_removed() {
        let mut pool = small_pool();

        let key = pool.insert(7).unwrap();
        pool.remove(key);

        assert_eq!(pool.arena_count(), 1);
        assert!(pool.is_empty());
        assert!(pool.len() > 0);
    }

    #[test]
    fn arena_limit_reports_compaction_required() {
        let mut pool = small_pool();

        let mut next = 0_u64;
        let err = loop {
            match pool.insert(next) {
                Ok(_) => next += 1,
                Err(err) => break err,
            }
        };

        assert_eq!(err, PoolError::CompactionRequired);
        assert_eq!(pool.arena_count(), MAX_ARENAS);
        // The pool is still usable after the failed growth.
        assert_eq!(pool.used(), next as usize);
    }

    #[test]
    fn fragmented_pool_requests_defragmentation() {
        let mut pool = small_pool();

        let keys: Vec<_> = (0..64_u64).map(|v| pool.insert(v).unwrap()).collect();
        assert!(pool.arena_count() > 1);
        assert!(!pool.should_defragment());

        // Punch holes in every arena so none empties but most slots are free.
        for (i, key) in keys.iter().enumerate() {
            if i % 4 != 0 {
                pool.remove(*key);
            }
        }

        assert!(pool.should_defragment());
    }

    #[test]
    fn small_pools_are_not_worth_defragmenting() {
        let mut pool = RecordPool::<u64>::new();

        let key = pool.insert(1).unwrap();
        pool.remove(key);

        assert!(!pool.should_defragment());
    }

    #[test]
    fn clear_resets_everything() {
        let mut pool = small_pool();

        for v in 0..20_u64 {
            _ = pool.insert(v).unwrap();
        }

        pool.clear();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool.arena_count(), 0);

        // The pool grows again after a clear.
        _ = pool.insert(1).unwrap();
        assert_eq!(pool.used(), 1);
    }

    #[test]
    fn with_reserved_preallocates_one_arena() {
        let pool = RecordPool::<u64>::with_reserved(100, 16).unwrap();

        assert_eq!(pool.arena_count(), 1);
        assert!(pool.len() >= 100);
        assert!(pool.is_empty());
    }
}
