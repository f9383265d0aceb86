//! # Boot Memory Regions
//!
//! The boot-info parser hands the kernel a list of [`MemoryRegion`]s. Only
//! [`MemoryRegionType::Available`] regions are given to the frame allocator;
//! everything else is reported and left alone.

use core::fmt;

/// Classification of a physical memory region.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionType {
    /// Usable RAM.
    Available = 1,
    /// Firmware or hardware reserved.
    Reserved,
    /// ACPI tables; reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    Bad,
    /// Kernel image.
    Kernel,
    /// Boot stack.
    Stack,
    /// Early heap.
    Heap,
}

impl MemoryRegionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Reserved => "Reserved",
            Self::AcpiReclaimable => "ACPI Reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::Bad => "Bad",
            Self::Kernel => "Kernel",
            Self::Stack => "Stack",
            Self::Heap => "Heap",
        }
    }
}

impl fmt::Display for MemoryRegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute bits reported alongside a region. Carried through unchanged.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct MemoryRegionFlags(pub u32);

/// One physical memory region as reported at boot.
///
/// Regions are immutable after ingestion; the frame allocator keeps a copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// First physical byte.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
    pub kind: MemoryRegionType,
    pub flags: MemoryRegionFlags,
    /// Human readable name for diagnostics.
    pub label: &'static str,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, size: u64, kind: MemoryRegionType) -> Self {
        Self {
            start,
            size,
            kind,
            flags: MemoryRegionFlags(0),
            label: "",
        }
    }

    /// Shorthand for an [`MemoryRegionType::Available`] region.
    #[must_use]
    pub const fn available(start: u64, size: u64) -> Self {
        Self::new(start, size, MemoryRegionType::Available)
    }

    #[must_use]
    pub const fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Exclusive end address (saturating).
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryRegionType::Available)
    }
}
