//! # Address Space (x86-64, PML4-rooted)
//!
//! A single four-level translation tree and the primitive operations on it:
//!
//! - [`AddressSpace::map_one`] installs one 4 KiB leaf, creating missing
//!   PDPT/PD/PT nodes on the way down.
//! - [`AddressSpace::unmap_one`] clears one leaf.
//! - [`AddressSpace::query`] translates a virtual address.
//! - [`AddressSpace::set_leaf_flags`] rewrites the permissions of a leaf.
//!
//! Intermediate nodes are linked present + writable, and user-accessible
//! whenever any leaf below them is. The effective permission of a page is
//! therefore decided by its leaf alone.
//!
//! Nodes are never reclaimed, even when all their entries become absent.
//!
//! This layer does no TLB maintenance; callers that modify a live tree must
//! invalidate through [`TlbFlush`](crate::TlbFlush).

use crate::page_table::{PageTable, PageTableEntry, TableLevel};
use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use log::trace;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    /// PML4 frame.
    root: PhysicalPage,
    mapper: &'m M,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressSpaceMapOneError {
    #[error("no frame available for a page-table node while mapping {0}")]
    OutOfMemory(VirtualAddress),
}

/// What a successful [`AddressSpace::map_one`] changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapOutcome {
    /// The frame previously mapped at this page, if the leaf was present.
    pub replaced: Option<PhysicalPage>,
    /// Number of intermediate nodes allocated for this mapping (0..=3).
    pub tables_created: u8,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing tree.
    ///
    /// # Safety
    /// `root` must hold a valid PML4 reachable through `mapper`, and every
    /// node linked below it must be reachable as well. No other handle may
    /// mutate the tree while this one is alive.
    #[inline]
    pub const unsafe fn from_root(mapper: &'m M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate and clear a fresh PML4.
    ///
    /// Returns `None` if `alloc` is exhausted.
    ///
    /// # Safety
    /// Frames handed out by `alloc` must be reachable through `mapper`.
    pub unsafe fn create<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &mut A) -> Option<Self> {
        let root = alloc.alloc_4k()?;
        let space = Self { root, mapper };
        space.table_mut(root).zero();
        trace!("New PML4 at {root}");
        Some(space)
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The tree must map the currently executing code, stack and data, and
    /// paging must be enabled in CR0/CR4/EFER.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn activate(&self) {
        let cr3 = self.root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, page: PhysicalPage) -> &mut PageTable {
        // SAFETY: every node in the tree is reachable through the mapper
        // (see constructors), and borrows never outlive a single step.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    #[inline]
    fn table(&self, page: PhysicalPage) -> &PageTable {
        self.table_mut(page)
    }

    /// Walk down to the PT covering `va` without creating anything.
    fn find_pt(&self, va: VirtualAddress) -> Option<PhysicalPage> {
        let mut node = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            node = self.table(node).get(level.index_of(va)).next_table()?;
        }
        Some(node)
    }

    /// Map one 4 KiB `page` to `frame` with `leaf_flags`.
    ///
    /// The leaf is always written present. An existing leaf is overwritten and
    /// reported in [`MapOutcome::replaced`].
    ///
    /// # Errors
    /// [`AddressSpaceMapOneError::OutOfMemory`] when a missing node cannot be
    /// allocated. Nodes created before the failure stay linked; no leaf is
    /// written.
    pub fn map_one<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        leaf_flags: PageEntryBits,
    ) -> Result<MapOutcome, AddressSpaceMapOneError> {
        let va = page.base();
        debug_assert!(va.is_canonical(), "non-canonical page {va}");

        let user = leaf_flags.user_access();
        let mut tables_created = 0u8;
        let mut node = self.root;

        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let i = level.index_of(va);
            let table = self.table_mut(node);
            let entry = table.get(i);

            node = if let Some(child) = entry.next_table() {
                if user && !entry.bits().user_access() {
                    table.set(i, PageTableEntry::link(child, true));
                }
                child
            } else {
                let child = alloc
                    .alloc_4k()
                    .ok_or(AddressSpaceMapOneError::OutOfMemory(va))?;
                self.table_mut(child).zero();
                table.set(i, PageTableEntry::link(child, user));
                tables_created += 1;
                trace!("New page-table node at {child} below {level:?} for {va}");
                child
            };
        }

        let i = TableLevel::Pt.index_of(va);
        let pt = self.table_mut(node);
        let replaced = pt.get(i).leaf_frame().map(|(f, _)| f);
        pt.set(i, PageTableEntry::leaf(frame, leaf_flags));

        Ok(MapOutcome {
            replaced,
            tables_created,
        })
    }

    /// Clear the leaf for `page` and return the frame it mapped.
    ///
    /// Returns `None` and changes nothing if the page was not mapped.
    pub fn unmap_one(&mut self, page: VirtualPage) -> Option<PhysicalPage> {
        let va = page.base();
        let pt = self.find_pt(va)?;
        let i = TableLevel::Pt.index_of(va);
        let table = self.table_mut(pt);
        let (frame, _) = table.get(i).leaf_frame()?;
        table.set(i, PageTableEntry::zero());
        Some(frame)
    }

    /// Replace the flags of the leaf for `page`, keeping its frame.
    ///
    /// Returns the previous flags, or `None` if the page was not mapped.
    /// Intermediate links are widened to user access if `flags` asks for it.
    pub fn set_leaf_flags(
        &mut self,
        page: VirtualPage,
        flags: PageEntryBits,
    ) -> Option<PageEntryBits> {
        let va = page.base();
        let pt = self.find_pt(va)?;
        let i = TableLevel::Pt.index_of(va);
        let (frame, old) = self.table(pt).get(i).leaf_frame()?;

        if flags.user_access() {
            let mut node = self.root;
            for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
                let j = level.index_of(va);
                let table = self.table_mut(node);
                let entry = table.get(j);
                let child = entry.next_table()?;
                if !entry.bits().user_access() {
                    table.set(j, PageTableEntry::link(child, true));
                }
                node = child;
            }
        }

        self.table_mut(pt).set(i, PageTableEntry::leaf(frame, flags));
        Some(old)
    }

    /// The leaf entry for `va`, if present.
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pt = self.find_pt(va)?;
        let e = self.table(pt).get(TableLevel::Pt.index_of(va));
        e.is_present().then_some(e)
    }

    /// Translate `va` to its physical address.
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, _) = self.leaf_entry(va)?.leaf_frame()?;
        Some(frame.join(va.page_offset()))
    }

    /// Number of nodes in the tree, the root included.
    #[must_use]
    pub fn table_count(&self) -> usize {
        let mut count = 1;
        for (_, l4) in self.table(self.root).present() {
            let Some(pdpt) = l4.next_table() else { continue };
            count += 1;
            for (_, l3) in self.table(pdpt).present() {
                let Some(pd) = l3.next_table() else { continue };
                count += 1;
                count += self.table(pd).present().count();
            }
        }
        count
    }

    /// Number of present 4 KiB leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        for (_, l4) in self.table(self.root).present() {
            let Some(pdpt) = l4.next_table() else { continue };
            for (_, l3) in self.table(pdpt).present() {
                let Some(pd) = l3.next_table() else { continue };
                for (_, l2) in self.table(pd).present() {
                    let Some(pt) = l2.next_table() else { continue };
                    count += self.table(pt).present().count();
                }
            }
        }
        count
    }
}
