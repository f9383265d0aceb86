//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB page bases used by the
//! frame allocator, the page-table walker and the kernel heap.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage`] | A byte / frame in physical memory. |
//! | [`VirtualAddress`] / [`VirtualPage`] | A byte / page in the (kernel) virtual address space. |
//! | [`PageIndices`] | The four 9-bit table indices selected by a virtual address. |
//!
//! The wrappers are `#[repr(transparent)]` around `u64` and cost nothing at
//! runtime; they only prevent mixing the two address kinds.
//!
//! ## Address decomposition
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign  |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let idx = va.indices();
//! assert_eq!(idx.pml4, 511);
//! assert_eq!(idx.pdpt, 510);
//! assert_eq!(idx.pd, 0);
//! assert_eq!(idx.pt, 1);
//! assert_eq!(va.page_offset(), 0x234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use crate::physical_address::{PhysicalAddress, PhysicalPage};
pub use crate::virtual_address::{PageIndices, VirtualAddress, VirtualPage};

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page / frame in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] as `usize`, for slice lengths and byte counts.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// Number of entries in one page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Mask for the in-page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,  16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow;
/// use [`checked_align_up`] when the input is untrusted.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Overflow-checked [`align_up`].
///
/// ```rust
/// # use kernel_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(4097, 4096), Some(8192));
/// assert_eq!(checked_align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// `usize` flavor of [`checked_align_up`], used for byte counts.
#[inline]
#[must_use]
pub const fn checked_align_up_usize(x: usize, a: usize) -> Option<usize> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of `a` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::is_aligned;
/// assert!(is_aligned(0x12340, 16));
/// assert!(!is_aligned(0x12345, 16));
/// ```
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

/// Number of pages needed to cover `bytes`, rounding up.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(8192), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
