//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// Low physical memory that is identity mapped at boot, so the code that
/// switches to the new page tables keeps running at its physical address.
pub const IDENTITY_LOW_BYTES: u64 = 0x20_0000; // 2 MiB

/// Where the kernel executes (VMA). Physical frames of the kernel image are
/// mapped at `KERNEL_BASE + (pa - KERNEL_PHYS_START)`.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First physical byte of the kernel image mapping.
pub const KERNEL_PHYS_START: u64 = 0;

/// Size of the physical range mapped to [`KERNEL_BASE`].
pub const KERNEL_IMAGE_BYTES: u64 = 0x0100_0000; // 16 MiB

/// Start of the kernel heap's reserved virtual range.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_ffff_9000_0000;

/// Size of the kernel heap's reserved virtual range. The heap never grows.
pub const KERNEL_HEAP_SIZE: u64 = 0x10_0000; // 1 MiB

/// Higher Half Direct Map base: physical address `pa` is reachable at
/// `HHDM_BASE + pa` once the direct map is installed.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Maximum number of boot memory regions the frame allocator ingests.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Typed [`KERNEL_HEAP_BASE`].
#[must_use]
pub const fn kernel_heap_base() -> VirtualAddress {
    VirtualAddress::new(KERNEL_HEAP_BASE)
}

const _: () = {
    assert!(IDENTITY_LOW_BYTES.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_IMAGE_BYTES.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE >= KERNEL_BASE + KERNEL_IMAGE_BYTES);
    assert!(KERNEL_HEAP_BASE.checked_add(KERNEL_HEAP_SIZE).is_some());
};
