//! # Kernel Memory Management
//!
//! The physical frame allocator, the kernel address-space manager and the
//! kernel heap, layered bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap (heap)                         │
//! │    • first-fit free list in a fixed virtual range   │
//! │    • split on allocate, coalesce on free            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ heap window mapped at boot
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Virtual Memory Manager (vmm)               │
//! │    • map / unmap / translate / protect              │
//! │    • identity + high-half kernel boot mappings      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames for page-table nodes
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Physical Frame Allocator (frame_alloc)       │
//! │    • one bit per available 4 KiB frame              │
//! │    • first-fit single frames and contiguous runs    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`manager::MemoryManager`] ties the three together behind coarse locks.
//! Physical memory is reached through a [`PhysMapper`](kernel_vmem::PhysMapper)
//! ([`phys_mapper`]), which also lets the whole stack run on the host in
//! tests with simulated RAM.
//!
//! ## Boot sequence
//!
//! ```ignore
//! let words = BitmapFrameAlloc::<IdentityPhysMapper>::bitmap_words_for(&regions);
//! let mm = unsafe {
//!     MemoryManager::init(&regions, bitmap_storage(words), &IdentityPhysMapper,
//!                         HardwareTlb, &BootLayout::default())?
//! };
//! mm.map_heap_window(kernel_heap_base(), KERNEL_HEAP_SIZE)?;
//! unsafe { mm.init_heap(heap_ptr, KERNEL_HEAP_SIZE as usize)? };
//! ```
//!
//! ## Errors
//!
//! Each subsystem has its own error enum; [`MemoryError`] unifies them.
//! Out-of-memory and not-mapped are ordinary results. Bad frees are logged
//! and ignored. Heap corruption is reported (or panics, see
//! [`heap::CorruptionPolicy`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod error;
pub mod frame_alloc;
pub mod heap;
pub mod locked_heap;
pub mod manager;
pub mod phys_mapper;
pub mod util;
pub mod vmm;

pub use crate::error::MemoryError;
pub use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError, FrameSpan, FrameStats};
pub use crate::heap::{CorruptionPolicy, HeapAllocator, HeapError, HeapStats};
pub use crate::locked_heap::LockedHeap;
pub use crate::manager::MemoryManager;
pub use crate::vmm::{BootLayout, Vmm, VmmError, VmmStats};
