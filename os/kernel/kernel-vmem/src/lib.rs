//! # Virtual Memory Support
//!
//! Four-level x86-64 paging primitives for the kernel's address-space manager.
//!
//! ## What you get
//! - [`PageEntryBits`]: the 64-bit page-table entry as a bitfield.
//! - [`PageTable`]: a 4 KiB-aligned node of 512 entries, used at every level.
//! - [`AddressSpace`]: a PML4-rooted tree with lazy creation of intermediate
//!   nodes, single-page map/unmap and translation.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (where table frames
//!   come from), [`PhysMapper`] (how a physical frame is reached from the
//!   current address space) and [`TlbFlush`] (translation-cache maintenance).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//!
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//! ```
//!
//! Every non-leaf entry either is absent or points to exactly one child node,
//! owned by that entry alone. Only 4 KiB leaves are created.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
mod page_table;
pub mod tlb;

pub use crate::address_space::{AddressSpace, AddressSpaceMapOneError, MapOutcome};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, PageTableEntry, TableLevel};
pub use crate::tlb::{NoopTlb, TlbFlush};
#[cfg(target_arch = "x86_64")]
pub use crate::tlb::HardwareTlb;
pub use kernel_memory_addresses as addresses;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// Source of **physical** 4 KiB frames for page-table nodes.
///
/// Returned frames must be page aligned and exclusively owned by the caller.
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one zero-filled 4 KiB frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        (**self).alloc_4k()
    }
}

/// Converts physical addresses to pointers usable in the current virtual
/// address space (identity map during early boot, HHDM afterwards, host
/// memory in tests).
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    ///
    /// Computing the pointer is always safe; dereferencing it requires the
    /// mapping to be live and writable.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for the whole `size_of::<T>()` bytes.
    /// - The bytes must be a valid `T` and must not be aliased for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}
