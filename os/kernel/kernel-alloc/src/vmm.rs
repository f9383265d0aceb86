//! # Virtual Memory Manager
//!
//! Map, unmap, translate and protect pages in the kernel address space.
//!
//! [`Vmm`] owns one [`AddressSpace`] and the [`TlbFlush`] used after every
//! change to it. Frames for new page-table nodes come from the
//! [`FrameAlloc`] passed into each mutating call, so the caller decides
//! which allocator (and which lock) is involved.
//!
//! ```ignore
//! let mut vmm = unsafe { Vmm::new(&mapper, HardwareTlb, &mut pmm)? };
//! vmm.bootstrap(&mut pmm, &BootLayout::default())?;
//! vmm.map_page(&mut pmm, va, pa, PageEntryBits::kernel_rw())?;
//! assert_eq!(vmm.get_physical(va + 0x10), Some(pa + 0x10));
//! ```

use kernel_info::memory::{IDENTITY_LOW_BYTES, KERNEL_BASE, KERNEL_IMAGE_BYTES, KERNEL_PHYS_START};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage, align_down,
    checked_align_up,
};
use kernel_vmem::{
    AddressSpace, AddressSpaceMapOneError, FrameAlloc, PageEntryBits, PhysMapper, TlbFlush,
};
use log::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("address not mapped")]
    NotMapped,
}

impl From<AddressSpaceMapOneError> for VmmError {
    fn from(value: AddressSpaceMapOneError) -> Self {
        match value {
            AddressSpaceMapOneError::OutOfMemory(_) => Self::OutOfMemory,
        }
    }
}

/// The two boot-time mappings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootLayout {
    /// Low physical memory identity mapped, page 0 excluded.
    pub identity_bytes: u64,
    /// First physical byte of the kernel image.
    pub kernel_phys_start: u64,
    /// Virtual address `kernel_phys_start` is mapped to.
    pub kernel_virt_base: u64,
    /// Bytes of the kernel image to map.
    pub kernel_image_bytes: u64,
}

impl Default for BootLayout {
    fn default() -> Self {
        Self {
            identity_bytes: IDENTITY_LOW_BYTES,
            kernel_phys_start: KERNEL_PHYS_START,
            kernel_virt_base: KERNEL_BASE,
            kernel_image_bytes: KERNEL_IMAGE_BYTES,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VmmStats {
    /// Present 4 KiB leaves.
    pub mapped_pages: usize,
    /// Frames used by page-table nodes, the root included.
    pub table_frames: usize,
}

/// Kernel virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, T: TlbFlush> {
    space: AddressSpace<'m, M>,
    tlb: T,
    stats: VmmStats,
}

impl<'m, M: PhysMapper, T: TlbFlush> Vmm<'m, M, T> {
    /// Create an empty address space with a fresh root table.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available for the root.
    ///
    /// # Safety
    /// Frames handed out by `alloc` must be reachable through `mapper`.
    pub unsafe fn new<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        tlb: T,
        alloc: &mut A,
    ) -> Result<Self, VmmError> {
        let Some(space) = (unsafe { AddressSpace::create(mapper, alloc) }) else {
            error!("VMM: no frame for the root table");
            return Err(VmmError::OutOfMemory);
        };
        info!("VMM: root table at {}", space.root_page());
        Ok(Self {
            space,
            tlb,
            stats: VmmStats {
                mapped_pages: 0,
                table_frames: 1,
            },
        })
    }

    /// Manage an existing tree rooted at `root`.
    ///
    /// # Safety
    /// See [`AddressSpace::from_root`].
    pub unsafe fn from_root(mapper: &'m M, root: PhysicalPage, tlb: T) -> Self {
        let space = unsafe { AddressSpace::from_root(mapper, root) };
        let stats = VmmStats {
            mapped_pages: space.leaf_count(),
            table_frames: space.table_count(),
        };
        Self { space, tlb, stats }
    }

    /// Identity-map low memory and map the kernel image to its high base.
    ///
    /// # Errors
    /// Propagates the first failing [`map_range`](Self::map_range).
    pub fn bootstrap<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        layout: &BootLayout,
    ) -> Result<(), VmmError> {
        // Page 0 stays unmapped so null dereferences fault.
        let identity = layout.identity_bytes.saturating_sub(PAGE_SIZE);
        if identity > 0 {
            self.map_range(
                alloc,
                VirtualAddress::new(PAGE_SIZE),
                PhysicalAddress::new(PAGE_SIZE),
                identity,
                PageEntryBits::kernel_rw(),
            )
            .inspect_err(|e| error!("VMM: identity map failed: {e}"))?;
        }

        self.map_range(
            alloc,
            VirtualAddress::new(layout.kernel_virt_base),
            PhysicalAddress::new(layout.kernel_phys_start),
            layout.kernel_image_bytes,
            PageEntryBits::kernel_rw().with_global_translation(true),
        )
        .inspect_err(|e| error!("VMM: kernel image map failed: {e}"))?;

        info!(
            "VMM: identity {:#x}..{:#x}, kernel {:#x} -> {:#x} ({} KiB)",
            PAGE_SIZE,
            layout.identity_bytes,
            layout.kernel_phys_start,
            layout.kernel_virt_base,
            layout.kernel_image_bytes / 1024
        );
        self.log_stats();
        Ok(())
    }

    /// Map the page at `virt` to the frame at `phys` with `flags`.
    ///
    /// The leaf is written present regardless of `flags`. Missing page-table
    /// nodes are taken from `alloc`. A present mapping is overwritten with a
    /// warning.
    ///
    /// # Errors
    /// - [`VmmError::InvalidArgument`] for unaligned or non-canonical input,
    ///   or a frame beyond the 52-bit physical address space.
    /// - [`VmmError::OutOfMemory`] if a page-table node cannot be allocated.
    pub fn map_page<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        if !virt.is_page_aligned() {
            return Err(VmmError::InvalidArgument("virtual address not page aligned"));
        }
        if !phys.is_page_aligned() {
            return Err(VmmError::InvalidArgument("physical address not page aligned"));
        }
        if !virt.is_canonical() {
            return Err(VmmError::InvalidArgument("non-canonical virtual address"));
        }
        if !fits_entry(phys.as_u64()) {
            return Err(VmmError::InvalidArgument("physical address beyond 52 bits"));
        }

        let outcome = match self.space.map_one(alloc, virt.page(), phys.page(), flags) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("VMM: {e}");
                self.stats.table_frames = self.space.table_count();
                return Err(e.into());
            }
        };

        self.stats.table_frames += usize::from(outcome.tables_created);
        match outcome.replaced {
            Some(old) => warn!("VMM: remapping {virt}: {old} -> {phys}"),
            None => self.stats.mapped_pages += 1,
        }

        self.tlb.invalidate_page(virt);
        Ok(())
    }

    /// Remove the mapping of the page at `virt` and return its frame.
    ///
    /// Page-table nodes are kept even if they become empty.
    ///
    /// # Errors
    /// - [`VmmError::InvalidArgument`] if `virt` is not page aligned or not
    ///   canonical.
    /// - [`VmmError::NotMapped`] if nothing was mapped; nothing changes.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        if !virt.is_page_aligned() {
            return Err(VmmError::InvalidArgument("virtual address not page aligned"));
        }
        if !virt.is_canonical() {
            return Err(VmmError::InvalidArgument("non-canonical virtual address"));
        }
        let frame = self.space.unmap_one(virt.page()).ok_or(VmmError::NotMapped)?;
        self.stats.mapped_pages -= 1;
        self.tlb.invalidate_page(virt);
        debug!("VMM: unmapped {virt} (was {frame})");
        Ok(frame.base())
    }

    /// Translate `virt`, keeping its offset within the page. Non-canonical
    /// addresses are never mapped.
    #[must_use]
    pub fn get_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        if !virt.is_canonical() {
            return None;
        }
        self.space.query(virt)
    }

    #[must_use]
    pub fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.query_flags(virt).is_some()
    }

    /// Leaf flags of the page containing `virt`, address bits cleared.
    #[must_use]
    pub fn query_flags(&self, virt: VirtualAddress) -> Option<PageEntryBits> {
        if !virt.is_canonical() {
            return None;
        }
        self.space.leaf_entry(virt).map(|e| e.bits().flags())
    }

    /// Apply `flags` to every mapped page overlapping `[start, start + size)`.
    ///
    /// Unmapped pages in the range are skipped. Returns the number of pages
    /// changed.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] if the range wraps the address space or
    /// leaves the canonical half it starts in.
    pub fn protect(
        &mut self,
        start: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<usize, VmmError> {
        if size == 0 {
            return Ok(0);
        }
        let end = start
            .as_u64()
            .checked_add(size)
            .and_then(|end| checked_align_up(end, PAGE_SIZE))
            .ok_or(VmmError::InvalidArgument("range overflows"))?;
        let first = align_down(start.as_u64(), PAGE_SIZE);
        let last = VirtualAddress::new(end - 1);
        if !start.is_canonical() || !last.is_canonical() || first >> 47 != last.as_u64() >> 47 {
            return Err(VmmError::InvalidArgument("non-canonical virtual address"));
        }

        let mut changed = 0;
        let mut page = VirtualPage::containing(VirtualAddress::new(first));
        for _ in 0..(end - first) / PAGE_SIZE {
            if self.space.set_leaf_flags(page, flags).is_some() {
                self.tlb.invalidate_page(page.base());
                changed += 1;
            }
            page = page.step(1);
        }

        debug!("VMM: protect {first:#x}..{end:#x}: {changed} page(s)");
        Ok(changed)
    }

    /// Map `len` bytes (rounded up to pages) at `virt` to consecutive frames
    /// starting at `phys`.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page); pages mapped before a failure stay mapped.
    pub fn map_range<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let pages = range_pages(virt, len)?;
        let Some(end) = phys.as_u64().checked_add(pages * PAGE_SIZE) else {
            return Err(VmmError::InvalidArgument("range overflows"));
        };
        if pages > 0 && !fits_entry(align_down(end - 1, PAGE_SIZE)) {
            return Err(VmmError::InvalidArgument("physical address beyond 52 bits"));
        }
        for i in 0..pages {
            self.map_page(alloc, virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags)?;
        }
        Ok(())
    }

    /// Back `len` bytes at `virt` with fresh frames from `alloc`, one by one.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when `alloc` runs dry; pages mapped until
    /// then stay mapped.
    pub fn map_anonymous<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        virt: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let pages = range_pages(virt, len)?;
        for i in 0..pages {
            let Some(frame) = alloc.alloc_4k() else {
                warn!("VMM: out of frames after {i} of {pages} anonymous pages");
                return Err(VmmError::OutOfMemory);
            };
            self.map_page(alloc, virt + i * PAGE_SIZE, frame.base(), flags)?;
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> VmmStats {
        self.stats
    }

    pub fn log_stats(&self) {
        info!(
            "VMM: {} page(s) mapped, {} table frame(s), root {}",
            self.stats.mapped_pages,
            self.stats.table_frames,
            self.space.root_page()
        );
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage {
        self.space.root_page()
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    #[inline]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    /// See [`AddressSpace::activate`].
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        unsafe { self.space.activate() };
        self.tlb.flush_all();
    }
}

/// Whether the page-aligned `phys` fits the frame-address field of an entry.
const fn fits_entry(phys: u64) -> bool {
    phys & !PageEntryBits::ADDRESS_MASK == 0
}

/// Page count of `[virt, virt + len)` after rounding `len` up.
fn range_pages(virt: VirtualAddress, len: u64) -> Result<u64, VmmError> {
    if !virt.is_page_aligned() {
        return Err(VmmError::InvalidArgument("virtual address not page aligned"));
    }
    let len = checked_align_up(len, PAGE_SIZE).ok_or(VmmError::InvalidArgument("range overflows"))?;
    if virt.checked_add(len).is_none() {
        return Err(VmmError::InvalidArgument("range overflows"));
    }
    Ok(len / PAGE_SIZE)
}
