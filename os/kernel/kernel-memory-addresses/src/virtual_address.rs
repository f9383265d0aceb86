use crate::{PAGE_OFFSET_MASK, PAGE_SIZE};
use core::fmt;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Virtual memory address.
///
/// Carries the *kind* of address only; canonicality is checked explicitly
/// with [`VirtualAddress::is_canonical`] where it matters (mapping).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// A 4 KiB virtual page, identified by its page-aligned base.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

/// The four page-table indices selected by a virtual address.
///
/// Each index is in `0..512`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageIndices {
    /// Bits 47..=39.
    pub pml4: usize,
    /// Bits 38..=30.
    pub pdpt: usize,
    /// Bits 29..=21.
    pub pd: usize,
    /// Bits 20..=12.
    pub pt: usize,
}

impl PageIndices {
    /// The indices from the top level down, in walk order.
    #[inline]
    #[must_use]
    pub const fn as_array(self) -> [usize; 4] {
        [self.pml4, self.pdpt, self.pd, self.pt]
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Bits 63..=48 must all equal bit 47.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::VirtualAddress;
    /// assert!(VirtualAddress::new(0x0000_7fff_ffff_f000).is_canonical());
    /// assert!(VirtualAddress::new(0xffff_8000_0000_0000).is_canonical());
    /// assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    /// ```
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn is_canonical(self) -> bool {
        let extended = (((self.0 << 16) as i64) >> 16) as u64;
        extended == self.0
    }

    /// Split into the four 9-bit table indices.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn indices(self) -> PageIndices {
        PageIndices {
            pml4: ((self.0 >> 39) & 0x1FF) as usize,
            pdpt: ((self.0 >> 30) & 0x1FF) as usize,
            pd: ((self.0 >> 21) & 0x1FF) as usize,
            pt: ((self.0 >> 12) & 0x1FF) as usize,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl VirtualPage {
    /// Page that contains `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(va.0 & !PAGE_OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        VirtualAddress(self.0 | (offset & PAGE_OFFSET_MASK))
    }

    #[inline]
    #[must_use]
    pub const fn step(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page(0x{:016X})", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(p: VirtualPage) -> Self {
        p.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
