//! # Page-table nodes
//!
//! All four levels share one node layout: 512 eight-byte entries in a 4 KiB
//! aligned frame. [`TableLevel`] names the level a node sits at and picks
//! the matching index out of a virtual address.

use crate::PageEntryBits;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalPage, VirtualAddress};

/// One entry of a [`PageTable`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct PageTableEntry(PageEntryBits);

impl PageTableEntry {
    /// A not-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: PageEntryBits) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// Link to a next-level table.
    #[inline]
    #[must_use]
    pub const fn link(table: PhysicalPage, user: bool) -> Self {
        Self(PageEntryBits::table_link(user).with_frame_address(table.base()))
    }

    /// 4 KiB leaf for `frame`. The present bit is forced and the PS bit cleared.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, flags: PageEntryBits) -> Self {
        Self(
            flags
                .flags()
                .with_present(true)
                .with_large_page(false)
                .with_frame_address(frame.base()),
        )
    }

    /// The child table this entry links to, if present.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if self.0.present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    /// The mapped frame and its flags, if this is a present leaf.
    #[inline]
    #[must_use]
    pub const fn leaf_frame(self) -> Option<(PhysicalPage, PageEntryBits)> {
        if self.0.present() {
            Some((self.0.frame(), self.0.flags()))
        } else {
            None
        }
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if !self.is_present() {
            return f.write_str("PageTableEntry(-)");
        }
        f.debug_struct("PageTableEntry")
            .field("frame", &self.0.frame())
            .field("w", &self.0.writable())
            .field("u", &self.0.user_access())
            .field("nx", &self.0.no_execute())
            .finish()
    }
}

/// A 4 KiB paging structure.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    /// Mark every entry not-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// Entry at `i`; `i` must be below 512.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    /// Indices and entries of every present slot.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.is_present())
    }
}

/// Level of a node in the four-level tree, top to bottom.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    /// Walk order.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// The index `va` selects at this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        let ix = va.indices();
        match self {
            Self::Pml4 => ix.pml4,
            Self::Pdpt => ix.pdpt,
            Self::Pd => ix.pd,
            Self::Pt => ix.pt,
        }
    }
}
