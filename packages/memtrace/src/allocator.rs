use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::engine::TraceEngine;

/// A [`GlobalAlloc`] wrapper that reports every operation to a
/// [`TraceEngine`].
///
/// Allocations continue to be served by the wrapped allocator; the engine
/// only records metadata about them. The engine's reentrancy guard keeps the
/// tracker's own internal allocations from being reported back into it, so
/// this wrapper is safe to install as the process's global allocator.
///
/// Typical setup: a `static` engine (for example behind `LazyLock`) wrapped
/// around the system allocator and registered with `#[global_allocator]`;
/// tracking starts once `enable` is called on the engine.
pub struct TracingAllocator<A = System> {
    inner: A,
    engine: &'static TraceEngine,
}

impl TracingAllocator<System> {
    /// Wraps the system allocator.
    #[must_use]
    pub const fn system(engine: &'static TraceEngine) -> Self {
        Self::new(System, engine)
    }
}

impl<A> TracingAllocator<A> {
    /// Wraps an arbitrary allocator.
    #[must_use]
    pub const fn new(inner: A, engine: &'static TraceEngine) -> Self {
        Self { inner, engine }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TracingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            self.engine.on_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.engine.on_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.engine.on_free(ptr as usize);
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            self.engine
                .on_realloc(ptr as usize, new_ptr as usize, new_size);
        }
        new_ptr
    }
}

impl<A> fmt::Debug for TracingAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingAllocator")
            .field("engine", self.engine)
            .finish_non_exhaustive()
    }
}
