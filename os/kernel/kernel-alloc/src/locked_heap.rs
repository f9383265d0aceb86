//! # Locked Heap
//!
//! [`HeapAllocator`] behind a spin lock, usable as the kernel's
//! `#[global_allocator]`:
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! // After the heap window is mapped:
//! unsafe { HEAP.init(heap_start, KERNEL_HEAP_SIZE as usize)? };
//! ```
//!
//! Requests with an alignment above [`HEAP_ALIGN`] cannot be served and
//! return null.

use crate::heap::{CorruptionPolicy, HEAP_ALIGN, HeapAllocator, HeapError, HeapStats};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use spin::{Mutex, MutexGuard};

pub struct LockedHeap(Mutex<HeapAllocator>);

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    #[must_use]
    pub const fn empty() -> Self {
        Self(Mutex::new(HeapAllocator::new()))
    }

    #[must_use]
    pub const fn with_policy(policy: CorruptionPolicy) -> Self {
        Self(Mutex::new(HeapAllocator::with_policy(policy)))
    }

    /// Initialize the heap over `[start, start + size)`.
    ///
    /// # Errors
    /// See [`HeapAllocator::init`].
    ///
    /// # Safety
    /// See [`HeapAllocator::init`].
    pub unsafe fn init(&self, start: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        unsafe { self.0.lock().init(start, size) }
    }

    /// Lock the heap for direct use.
    pub fn lock(&self) -> MutexGuard<'_, HeapAllocator> {
        self.0.lock()
    }

    pub fn stats(&self) -> HeapStats {
        self.0.lock().stats()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return null_mut();
        }
        self.0
            .lock()
            .allocate(layout.size().max(1))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Errors are already logged by the heap.
            let _ = self.0.lock().free(ptr);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // `allocate` always zeroes.
        unsafe { self.alloc(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return null_mut();
        }
        let Some(ptr) = NonNull::new(ptr) else {
            return null_mut();
        };
        self.0
            .lock()
            .reallocate(ptr, new_size.max(1))
            .map_or(null_mut(), NonNull::as_ptr)
    }
}
