use std::hash::BuildHasher;
use std::sync::Arc;

use foldhash::fast::FixedState;
use record_pool::PoolError;
use record_table::{compact_into, KeyOps, RecordTable, TablePool};

use crate::traceback::{Frame, Traceback};

/// Content hash used for filenames, both by the interning table and by the
/// traceback structural hash.
pub(crate) fn filename_hash(filename: &str) -> u64 {
    FixedState::default().hash_one(filename)
}

/// Hashes filename handles by content; equal handles short-circuit.
struct FilenameOps;

impl KeyOps<Arc<str>> for FilenameOps {
    fn hash_key(&self, key: &Arc<str>) -> u64 {
        filename_hash(key)
    }

    fn keys_equal(&self, a: &Arc<str>, b: &Arc<str>) -> bool {
        Arc::ptr_eq(a, b) || a == b
    }
}

/// Hashes tracebacks by their precomputed structural hash; interned-identity
/// fast path, frame-by-frame equality on collision.
struct TracebackOps;

impl KeyOps<Arc<Traceback>> for TracebackOps {
    fn hash_key(&self, key: &Arc<Traceback>) -> u64 {
        key.hash()
    }

    fn keys_equal(&self, a: &Arc<Traceback>, b: &Arc<Traceback>) -> bool {
        Arc::ptr_eq(a, b) || a == b
    }
}

/// The filename and traceback interning tables.
///
/// The tables hold one owning handle per distinct value; every trace and
/// frame holds clones of those handles, so structurally identical stacks
/// cost one `Arc` clone after the first occurrence.
pub(crate) struct Interner {
    filename_pool: TablePool<Arc<str>, ()>,
    filenames: RecordTable<Arc<str>, (), FilenameOps>,

    traceback_pool: TablePool<Arc<Traceback>, ()>,
    tracebacks: RecordTable<Arc<Traceback>, (), TracebackOps>,
}

impl Interner {
    pub(crate) fn new() -> Result<Self, PoolError> {
        Ok(Self {
            filename_pool: TablePool::new(),
            filenames: RecordTable::new(FilenameOps)?,
            traceback_pool: TablePool::new(),
            tracebacks: RecordTable::new(TracebackOps)?,
        })
    }

    /// Returns the canonical handle for a filename, interning it on first
    /// occurrence.
    pub(crate) fn intern_filename(&mut self, filename: &str) -> Result<Arc<str>, PoolError> {
        let candidate: Arc<str> = Arc::from(filename);

        if let Some(stored) = self.filenames.get_key(&self.filename_pool, &candidate) {
            return Ok(Arc::clone(stored));
        }

        match self
            .filenames
            .insert(&mut self.filename_pool, Arc::clone(&candidate), ())
        {
            Err(PoolError::CompactionRequired) => {
                compact_into(&mut self.filename_pool, &mut [&mut self.filenames], 1)?;
                self.filenames
                    .insert(&mut self.filename_pool, Arc::clone(&candidate), ())?;
            }
            result => result?,
        }

        Ok(candidate)
    }

    /// Returns the canonical traceback for a frame sequence, interning it on
    /// first occurrence.
    ///
    /// The frames are expected to carry handles produced by
    /// [`intern_filename`](Self::intern_filename); equality then resolves by
    /// handle identity and only falls back to content comparison on a hash
    /// collision.
    pub(crate) fn intern_traceback(&mut self, frames: &[Frame]) -> Result<Arc<Traceback>, PoolError> {
        let candidate = Arc::new(Traceback::new(
            frames.to_vec().into_boxed_slice(),
            filename_hash,
        ));

        if let Some(stored) = self.tracebacks.get_key(&self.traceback_pool, &candidate) {
            return Ok(Arc::clone(stored));
        }

        match self
            .tracebacks
            .insert(&mut self.traceback_pool, Arc::clone(&candidate), ())
        {
            Err(PoolError::CompactionRequired) => {
                compact_into(&mut self.traceback_pool, &mut [&mut self.tracebacks], 1)?;
                self.tracebacks
                    .insert(&mut self.traceback_pool, Arc::clone(&candidate), ())?;
            }
            result => result?,
        }

        Ok(candidate)
    }

    /// Releases every interned value and the arenas behind them.
    pub(crate) fn clear(&mut self) {
        self.filenames.clear(&mut self.filename_pool);
        self.filename_pool.clear();
        self.tracebacks.clear(&mut self.traceback_pool);
        self.traceback_pool.clear();
    }

    pub(crate) fn filename_count(&self) -> usize {
        self.filenames.len()
    }

    pub(crate) fn traceback_count(&self) -> usize {
        self.tracebacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(interner: &mut Interner, filename: &str, lineno: u32) -> Frame {
        Frame {
            filename: interner.intern_filename(filename).unwrap(),
            lineno,
        }
    }

    #[test]
    fn filename_interning_is_idempotent() {
        let mut interner = Interner::new().unwrap();

        let first = interner.intern_filename("a/b/c.py").unwrap();
        let second = interner.intern_filename("a/b/c.py").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(interner.filename_count(), 1);
    }

    #[test]
    fn distinct_filenames_stay_distinct() {
        let mut interner = Interner::new().unwrap();

        let a = interner.intern_filename("a.py").unwrap();
        let b = interner.intern_filename("b.py").unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.filename_count(), 2);
    }

    #[test]
    fn traceback_interning_is_idempotent() {
        let mut interner = Interner::new().unwrap();

        let frames = vec![
            frame(&mut interner, "a.py", 1),
            frame(&mut interner, "b.py", 2),
        ];
        let first = interner.intern_traceback(&frames).unwrap();

        // Re-intern through fresh (but content-equal) filename handles.
        let frames = vec![
            frame(&mut interner, "a.py", 1),
            frame(&mut interner, "b.py", 2),
        ];
        let second = interner.intern_traceback(&frames).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(interner.traceback_count(), 1);
    }

    #[test]
    fn different_linenos_make_different_tracebacks() {
        let mut interner = Interner::new().unwrap();

        let first = [frame(&mut interner, "a.py", 1)];
        let a = interner.intern_traceback(&first).unwrap();
        let second = [frame(&mut interner, "a.py", 2)];
        let b = interner.intern_traceback(&second).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.traceback_count(), 2);
    }

    #[test]
    fn clear_releases_everything() {
        let mut interner = Interner::new().unwrap();

        for index in 0..100_u32 {
            let captured = frame(&mut interner, &format!("file{index}.py"), index);
            interner.intern_traceback(&[captured]).unwrap();
        }
        assert_eq!(interner.filename_count(), 100);
        assert_eq!(interner.traceback_count(), 100);

        interner.clear();
        assert_eq!(interner.filename_count(), 0);
        assert_eq!(interner.traceback_count(), 0);

        // The interner keeps working after a clear.
        let handle = interner.intern_filename("again.py").unwrap();
        assert_eq!(&*handle, "again.py");
    }
}
