use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// One 64-bit x86-64 paging-structure entry.
///
/// The same layout is used at all four levels. A non-leaf entry links to the
/// next table; a leaf entry in the PT maps one 4 KiB frame. The address field
/// holds bits `[51:12]` of a page-aligned physical address.
///
/// | Bits   | Field                 |
/// |--------|-----------------------|
/// | 0      | present               |
/// | 1      | writable              |
/// | 2      | user                  |
/// | 3      | write-through         |
/// | 4      | cache-disable         |
/// | 5      | accessed              |
/// | 6      | dirty (leaf)          |
/// | 7      | page size (always 0)  |
/// | 8      | global (leaf)         |
/// | 9–11   | available to software |
/// | 12–51  | frame address         |
/// | 52–62  | available to software |
/// | 63     | no-execute            |
///
/// ```rust
/// # use kernel_vmem::addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_frame_address(PhysicalAddress::new(0x5000));
/// assert!(e.present() && e.writable());
/// assert_eq!(e.physical_address().as_u64(), 0x5000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// The entry is valid.
    pub present: bool,
    /// Writes are permitted.
    pub writable: bool,
    /// Ring-3 accesses are permitted.
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    /// Set by the CPU on first access.
    pub accessed: bool,
    /// Set by the CPU on first write through a leaf.
    pub dirty: bool,
    /// PS. Only 4 KiB leaves are built, so this stays clear.
    pub large_page: bool,
    /// Survives CR3 reloads (leaf only).
    pub global_translation: bool,
    #[bits(3)]
    pub os_available_low: u8,
    #[bits(40)]
    phys_addr_bits_51_12: u64,
    #[bits(11)]
    pub os_available_high: u16,
    /// Instruction fetches are blocked; requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Mask of the frame-address field.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::containing(self.physical_address())
    }

    /// The same entry with the address field cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        Self::from_bits(self.into_bits() & !Self::ADDRESS_MASK)
    }

    /// Present, writable, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Present, writable and reachable from ring 3.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// Flags for a link to a next-level table.
    ///
    /// Links are kept permissive; the leaf decides the effective access.
    #[inline]
    #[must_use]
    pub const fn table_link(user: bool) -> Self {
        Self::kernel_rw().with_user_access(user)
    }
}
