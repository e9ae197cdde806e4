//! A chained hash table whose entries live in a [`record_pool::RecordPool`].
//!
//! This crate provides [`RecordTable`], a hash table designed for the
//! bookkeeping tables of an allocation tracker: every entry is a fixed-size
//! record allocated from a shared pool, so table churn never touches the
//! system allocator once the pool is warm, and several tables can share one
//! pool to amortize its arenas.
//!
//! # Key Features
//!
//! - **Pooled entries**: entries are `record_pool` records chained per bucket
//!   through stable [`RecordKey`] links; the table itself owns only the
//!   bucket array.
//! - **Pluggable key strategy**: hashing and equality come from a [`KeyOps`]
//!   implementation carried by the table, so the same key type can be hashed
//!   by content in one table and by identity in another.
//! - **Load-factor maintenance**: the bucket array tracks the entry count
//!   within a load-factor window, reusing the hash stored in each record so a
//!   rehash never calls back into the key strategy.
//! - **Table-driven compaction**: [`compact_into`] rebuilds a fragmented pool
//!   by re-homing every table that shares it, which is how the pool's
//!   [`CompactionRequired`](record_pool::PoolError::CompactionRequired)
//!   signal is resolved.
//!
//! # Examples
//!
//! ```rust
//! use record_table::{KeyOps, RecordTable, TablePool};
//!
//! /// Hashes `u64` keys by value.
//! #[derive(Clone, Debug)]
//! struct DirectOps;
//!
//! impl KeyOps<u64> for DirectOps {
//!     fn hash_key(&self, key: &u64) -> u64 {
//!         *key
//!     }
//!
//!     fn keys_equal(&self, a: &u64, b: &u64) -> bool {
//!         a == b
//!     }
//! }
//!
//! let mut pool = TablePool::<u64, &str>::new();
//! let mut table = RecordTable::new(DirectOps)?;
//!
//! table.insert(&mut pool, 1, "one")?;
//! table.insert(&mut pool, 2, "two")?;
//!
//! assert_eq!(table.get(&pool, &1), Some(&"one"));
//! assert_eq!(table.pop(&mut pool, &2), Some("two"));
//! assert_eq!(table.len(), 1);
//! # Ok::<(), record_pool::PoolError>(())
//! ```

mod compact;
mod ops;
mod table;

pub use compact::compact_into;
pub use ops::KeyOps;
pub use record_pool::{PoolError, RecordKey, RecordPool};
pub use table::{RecordTable, TablePool, TableRecord};
