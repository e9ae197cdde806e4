use std::marker::PhantomData;
use std::ops::ControlFlow;

use record_pool::{PoolError, RecordKey, RecordPool};

use crate::ops::KeyOps;

/// Smallest bucket array a table will use.
pub(crate) const MIN_BUCKETS: usize = 32;

/// Load-factor window; the bucket array is resized when the entry count per
/// bucket leaves `[LOAD_LOW, LOAD_HIGH]`.
const LOAD_LOW: f64 = 0.10;
const LOAD_HIGH: f64 = 0.50;

/// Rehashing aims for the middle of the load-factor window.
const REHASH_FACTOR: f64 = 2.0 / (LOAD_LOW + LOAD_HIGH);

/// A pool of [`RecordTable`] entries.
///
/// Several tables with the same key and value types can share one pool; a
/// shared pool is compacted for all of them at once with
/// [`compact_into`](crate::compact_into).
pub type TablePool<K, V> = RecordPool<TableRecord<K, V>>;

/// One table entry, allocated from a [`TablePool`].
///
/// Entries in the same bucket are singly linked through `next`. The key's
/// hash is stored alongside it so rehashing and chain walks never call back
/// into the key strategy.
#[derive(Debug)]
pub struct TableRecord<K, V> {
    pub(crate) next: Option<RecordKey>,
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: V,
}

/// A chained hash table whose entries live in a shared [`TablePool`].
///
/// The table owns only its bucket array; entry storage belongs to the pool,
/// which is passed into every operation. This keeps the borrow structure
/// explicit and lets many tables share the pool's arenas.
///
/// The bucket array always holds a power of two of at least [`MIN_BUCKETS`]
/// buckets. When the load factor leaves its window the table resizes toward
/// the middle of the window; resizing is advisory, so a failed bucket
/// allocation leaves the table fully usable at its old size.
#[derive(Debug)]
pub struct RecordTable<K, V, S> {
    buckets: Box<[Option<RecordKey>]>,

    entries: usize,

    ops: S,

    _marker: PhantomData<fn() -> (K, V)>,
}

fn alloc_buckets(count: usize) -> Result<Box<[Option<RecordKey>]>, PoolError> {
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(count)
        .map_err(|_| PoolError::OutOfMemory)?;
    buckets.resize(count, None);
    Ok(buckets.into_boxed_slice())
}

/// Smallest power of two at or above `size`, floored at [`MIN_BUCKETS`].
fn round_buckets(size: usize) -> usize {
    size.max(MIN_BUCKETS)
        .checked_next_power_of_two()
        .expect("bucket counts stay far below usize::MAX")
}

/// Bucket count that puts `entries` in the middle of the load-factor window.
fn ideal_buckets(entries: usize) -> usize {
    round_buckets((entries as f64 * REHASH_FACTOR) as usize)
}

impl<K, V, S: KeyOps<K>> RecordTable<K, V, S> {
    /// Creates an empty table with the minimum bucket count.
    pub fn new(ops: S) -> Result<Self, PoolError> {
        Self::with_capacity(ops, 0)
    }

    /// Creates an empty table sized so `entries` entries fit inside the
    /// load-factor window without rehashing.
    pub fn with_capacity(ops: S, entries: usize) -> Result<Self, PoolError> {
        Ok(Self {
            buckets: alloc_buckets(ideal_buckets(entries))?,
            entries: 0,
            ops,
            _marker: PhantomData,
        })
    }

    /// Number of entries in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Current size of the bucket array.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated into a lying accessor.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, hash: u64) -> usize {
        debug_assert!(self.buckets.len().is_power_of_two());
        (hash & (self.buckets.len() as u64 - 1)) as usize
    }

    fn find(&self, pool: &TablePool<K, V>, hash: u64, key: &K) -> Option<RecordKey> {
        let mut cursor = self.buckets[self.bucket_index(hash)];

        while let Some(record_key) = cursor {
            let record = pool
                .get(record_key)
                .expect("bucket chains only hold live records");

            if record.hash == hash && self.ops.keys_equal(&record.key, key) {
                return Some(record_key);
            }

            cursor = record.next;
        }

        None
    }

    /// Inserts an entry for a key that is not yet in the table.
    ///
    /// The absence of `key` is the caller's responsibility (checked only by a
    /// debug assertion); allocation tracker tables always look up before they
    /// insert, so the table does not pay for a second chain walk here.
    ///
    /// Growth of the pool or of the bucket array can fail; the failure modes
    /// are those of [`RecordPool::insert`]. Bucket-array growth is advisory
    /// and never fails the insert itself.
    pub fn insert(&mut self, pool: &mut TablePool<K, V>, key: K, value: V) -> Result<(), PoolError> {
        let hash = self.ops.hash_key(&key);
        debug_assert!(
            self.find(pool, hash, &key).is_none(),
            "insert requires an absent key"
        );

        let index = self.bucket_index(hash);
        let record_key = pool.insert(TableRecord {
            next: self.buckets[index],
            hash,
            key,
            value,
        })?;

        self.buckets[index] = Some(record_key);
        self.entries = self
            .entries
            .checked_add(1)
            .expect("entry count is bounded by pool length");

        if self.entries as f64 > LOAD_HIGH * self.buckets.len() as f64 {
            self.maybe_rehash(pool);
        }

        Ok(())
    }

    /// Looks up the value for `key`.
    #[must_use]
    pub fn get<'p>(&self, pool: &'p TablePool<K, V>, key: &K) -> Option<&'p V> {
        let hash = self.ops.hash_key(key);
        let record_key = self.find(pool, hash, key)?;

        pool.get(record_key).map(|record| &record.value)
    }

    /// Looks up the value for `key`, mutably.
    #[must_use]
    pub fn get_mut<'p>(&self, pool: &'p mut TablePool<K, V>, key: &K) -> Option<&'p mut V> {
        let hash = self.ops.hash_key(key);
        let record_key = self.find(pool, hash, key)?;

        pool.get_mut(record_key).map(|record| &mut record.value)
    }

    /// Looks up the stored key equal to `key`.
    ///
    /// This is the interning primitive: probe with a transient key, get back
    /// the canonical stored one.
    #[must_use]
    pub fn get_key<'p>(&self, pool: &'p TablePool<K, V>, key: &K) -> Option<&'p K> {
        let hash = self.ops.hash_key(key);
        let record_key = self.find(pool, hash, key)?;

        pool.get(record_key).map(|record| &record.key)
    }

    /// Removes the entry for `key` and returns its value.
    pub fn pop(&mut self, pool: &mut TablePool<K, V>, key: &K) -> Option<V> {
        let hash = self.ops.hash_key(key);
        let index = self.bucket_index(hash);

        let mut previous: Option<RecordKey> = None;
        let mut cursor = self.buckets[index];
        while let Some(record_key) = cursor {
            let record = pool
                .get(record_key)
                .expect("bucket chains only hold live records");

            if record.hash == hash && self.ops.keys_equal(&record.key, key) {
                break;
            }

            previous = Some(record_key);
            cursor = record.next;
        }
        let record_key = cursor?;

        let record = pool.remove(record_key);
        match previous {
            Some(previous_key) => {
                pool.get_mut(previous_key)
                    .expect("bucket chains only hold live records")
                    .next = record.next;
            }
            None => self.buckets[index] = record.next,
        }

        self.entries = self
            .entries
            .checked_sub(1)
            .expect("an entry was just unlinked");

        if self.buckets.len() > MIN_BUCKETS
            && (self.entries as f64) < LOAD_LOW * self.buckets.len() as f64
        {
            self.maybe_rehash(pool);
        }

        Some(record.value)
    }

    /// Removes the entry for `key`, reporting whether it existed.
    pub fn remove(&mut self, pool: &mut TablePool<K, V>, key: &K) -> bool {
        self.pop(pool, key).is_some()
    }

    /// Visits every entry until the callback breaks.
    ///
    /// Returns the break value, or `None` when every entry was visited.
    /// Iteration order is unspecified.
    pub fn for_each<B>(
        &self,
        pool: &TablePool<K, V>,
        mut f: impl FnMut(&K, &V) -> ControlFlow<B>,
    ) -> Option<B> {
        for &bucket in &self.buckets {
            let mut cursor = bucket;

            while let Some(record_key) = cursor {
                let record = pool
                    .get(record_key)
                    .expect("bucket chains only hold live records");

                if let ControlFlow::Break(broke) = f(&record.key, &record.value) {
                    return Some(broke);
                }

                cursor = record.next;
            }
        }

        None
    }

    /// Deep-copies the table into `dst_pool`.
    ///
    /// Keys are cloned; values go through `copy_value`, which lets the caller
    /// deep-copy values that themselves own pooled records. On any failure
    /// the partial copy is released back to `dst_pool` and the error is
    /// returned; values already produced by `copy_value` are dropped, so any
    /// deeper cleanup is the closure's concern.
    pub fn copy_with<E>(
        &self,
        pool: &TablePool<K, V>,
        dst_pool: &mut TablePool<K, V>,
        mut copy_value: impl FnMut(&V) -> Result<V, E>,
    ) -> Result<Self, E>
    where
        K: Clone,
        S: Clone,
        E: From<PoolError>,
    {
        let mut copy = Self::with_capacity(self.ops.clone(), self.entries).map_err(E::from)?;

        for &bucket in &self.buckets {
            let mut cursor = bucket;

            while let Some(record_key) = cursor {
                let record = pool
                    .get(record_key)
                    .expect("bucket chains only hold live records");
                cursor = record.next;

                let value = match copy_value(&record.value) {
                    Ok(value) => value,
                    Err(error) => {
                        copy.clear(dst_pool);
                        return Err(error);
                    }
                };

                if let Err(error) = copy.insert(dst_pool, record.key.clone(), value) {
                    copy.clear(dst_pool);
                    return Err(E::from(error));
                }
            }
        }

        Ok(copy)
    }

    /// Removes every entry, releasing the records back to the pool.
    ///
    /// The bucket array shrinks back to the minimum size; the shrink is
    /// advisory like any other resize.
    pub fn clear(&mut self, pool: &mut TablePool<K, V>) {
        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();

            while let Some(record_key) = cursor {
                cursor = pool.remove(record_key).next;
            }
        }

        self.entries = 0;

        if self.buckets.len() > MIN_BUCKETS {
            if let Ok(buckets) = alloc_buckets(MIN_BUCKETS) {
                self.buckets = buckets;
            }
        }
    }

    /// Resizes the bucket array toward the middle of the load-factor window.
    ///
    /// Uses the hash stored in each record, so no key is rehashed. Advisory:
    /// if the new bucket array cannot be allocated, the table keeps its
    /// current one.
    fn maybe_rehash(&mut self, pool: &mut TablePool<K, V>) {
        let new_count = ideal_buckets(self.entries);
        if new_count == self.buckets.len() {
            return;
        }

        let Ok(mut new_buckets) = alloc_buckets(new_count) else {
            return;
        };
        let mask = new_count as u64 - 1;

        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();

            while let Some(record_key) = cursor {
                let record = pool
                    .get_mut(record_key)
                    .expect("bucket chains only hold live records");
                cursor = record.next;

                let bucket = &mut new_buckets[(record.hash & mask) as usize];
                record.next = *bucket;
                *bucket = Some(record_key);
            }
        }

        self.buckets = new_buckets;
    }

    /// Moves every record of this table from `old_pool` into `new_pool`,
    /// relinking the bucket chains with the new keys.
    ///
    /// `new_pool` must have capacity reserved for every moved record.
    pub(crate) fn rehome(&mut self, old_pool: &mut TablePool<K, V>, new_pool: &mut TablePool<K, V>) {
        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();
            let mut head = None;

            while let Some(record_key) = cursor {
                let mut record = old_pool.remove(record_key);
                cursor = record.next;

                record.next = head;
                head = Some(match new_pool.insert(record) {
                    Ok(new_key) => new_key,
                    Err(_) => unreachable!("destination pool is pre-sized for every record"),
                });
            }

            self.buckets[index] = head;
        }
    }
}
