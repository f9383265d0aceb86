//! # Physical Mappers
//!
//! [`PhysMapper`] implementations for the two ways the kernel reaches
//! physical memory:
//!
//! - [`IdentityPhysMapper`] while the boot identity map is active: physical
//!   address `pa` is at virtual address `pa`.
//! - [`HhdmPhysMapper`] once the higher-half direct map is installed: `pa` is
//!   at `HHDM_BASE + pa`.
//!
//! Computing the pointer is always safe. Dereferencing it is only valid if
//! the corresponding mapping is present.

use core::ptr;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// `pa -> HHDM_BASE + pa`.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        ptr::with_exposed_provenance_mut(HHDM_BASE.wrapping_add(pa.as_u64()) as usize)
    }
}

/// `pa -> pa`.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        ptr::with_exposed_provenance_mut(pa.as_u64() as usize)
    }
}
