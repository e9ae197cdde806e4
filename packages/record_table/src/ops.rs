/// Hashing and equality strategy for the keys of one [`RecordTable`].
///
/// The strategy travels with the table rather than with the key type, so the
/// same key type can live in several tables with different semantics. An
/// allocation tracker hashes interned strings by content when building the
/// intern table, but by handle identity everywhere else.
///
/// Implementations must be coherent: `keys_equal(a, b)` implies
/// `hash_key(a) == hash_key(b)`.
///
/// [`RecordTable`]: crate::RecordTable
pub trait KeyOps<K> {
    /// Hashes a key.
    ///
    /// The table stores the result in each record and reuses it for bucket
    /// placement during rehashing, so this is called once per inserted key
    /// and once per lookup.
    fn hash_key(&self, key: &K) -> u64;

    /// Whether two keys are equal.
    ///
    /// Only called on keys whose stored hashes already match.
    fn keys_equal(&self, a: &K, b: &K) -> bool;
}
