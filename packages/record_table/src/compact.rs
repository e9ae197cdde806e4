use record_pool::{PoolError, RecordPool};

use crate::ops::KeyOps;
use crate::table::{RecordTable, TablePool};

/// Rebuilds `pool` into freshly sized arenas, re-homing every table in
/// `tables`.
///
/// This is how a pool's
/// [`CompactionRequired`](PoolError::CompactionRequired) signal and its
/// [`should_defragment`](RecordPool::should_defragment) hint are resolved:
/// the pool cannot relocate records itself because the tables hold the keys,
/// so the tables move their own records and relink their bucket chains.
///
/// Every table sharing the pool must be included; records of a table that is
/// left out would be dropped with the old pool, leaving that table with
/// dangling keys. `extra_capacity` reserves room on top of the live records,
/// for the insert that triggered the compaction.
///
/// On allocation failure the old pool and every table are left untouched.
pub fn compact_into<K, V, S: KeyOps<K>>(
    pool: &mut TablePool<K, V>,
    tables: &mut [&mut RecordTable<K, V, S>],
    extra_capacity: usize,
) -> Result<(), PoolError> {
    let reserved = pool
        .used()
        .checked_add(extra_capacity)
        .expect("pool sizes stay far below usize::MAX");

    let mut new_pool = RecordPool::with_reserved(reserved, pool.min_arena_bytes())?;

    for table in &mut *tables {
        table.rehome(pool, &mut new_pool);
    }

    debug_assert!(
        pool.is_empty(),
        "a table sharing the pool was left out of the compaction"
    );

    *pool = new_pool;
    Ok(())
}
