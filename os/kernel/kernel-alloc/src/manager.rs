//! # Memory Manager
//!
//! The boot-time context that owns the frame allocator, the kernel address
//! space and the heap, each behind its own lock:
//!
//! | Subsystem | Lock             |
//! |-----------|------------------|
//! | frames    | `spin::Mutex`    |
//! | VMM       | `spin::RwLock`; translations share the read side |
//! | heap      | `spin::Mutex` (inside [`LockedHeap`]) |
//!
//! Operations that touch both the VMM and the frame allocator take the VMM
//! lock first.

use crate::error::MemoryError;
use crate::frame_alloc::{BitmapFrameAlloc, FrameStats};
use crate::heap::HeapStats;
use crate::locked_heap::LockedHeap;
use crate::vmm::{BootLayout, Vmm, VmmStats};
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_vmem::{PageEntryBits, PhysMapper, TlbFlush};
use log::{error, info};
use spin::{Mutex, RwLock};

pub struct MemoryManager<'m, M: PhysMapper, T: TlbFlush> {
    frames: Mutex<BitmapFrameAlloc<'m, M>>,
    vmm: RwLock<Vmm<'m, M, T>>,
    heap: LockedHeap,
}

impl<'m, M: PhysMapper, T: TlbFlush> MemoryManager<'m, M, T> {
    /// Bring up the frame allocator and the kernel address space, including
    /// the boot mappings of `layout`. The heap is set up separately with
    /// [`map_heap_window`](Self::map_heap_window) and [`init_heap`](Self::init_heap).
    ///
    /// # Errors
    /// Whatever [`BitmapFrameAlloc::new`], [`Vmm::new`] or
    /// [`Vmm::bootstrap`] report.
    ///
    /// # Safety
    /// Every available frame in `regions` must be reachable and writable
    /// through `mapper` and not used by anything else.
    pub unsafe fn init(
        regions: &[MemoryRegion],
        bitmap: &'m mut [u64],
        mapper: &'m M,
        tlb: T,
        layout: &BootLayout,
    ) -> Result<Self, MemoryError> {
        let mut frames = unsafe { BitmapFrameAlloc::new(regions, bitmap, mapper) }?;
        frames.log_layout();

        let mut vmm = unsafe { Vmm::new(mapper, tlb, &mut frames) }?;
        vmm.bootstrap(&mut frames, layout)?;

        info!("Memory manager ready");
        Ok(Self {
            frames: Mutex::new(frames),
            vmm: RwLock::new(vmm),
            heap: LockedHeap::empty(),
        })
    }

    pub fn alloc_page(&self) -> Result<PhysicalAddress, MemoryError> {
        Ok(self.frames.lock().alloc_page()?)
    }

    pub fn alloc_pages(&self, count: usize) -> Result<PhysicalAddress, MemoryError> {
        Ok(self.frames.lock().alloc_pages(count)?)
    }

    pub fn free_page(&self, addr: PhysicalAddress) {
        self.frames.lock().free_page(addr);
    }

    pub fn free_pages(&self, addr: PhysicalAddress, count: usize) {
        self.frames.lock().free_pages(addr, count);
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.lock().stats()
    }

    pub fn map_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let mut vmm = self.vmm.write();
        let mut frames = self.frames.lock();
        Ok(vmm.map_page(&mut *frames, virt, phys, flags)?)
    }

    pub fn unmap_page(&self, virt: VirtualAddress) -> Result<PhysicalAddress, MemoryError> {
        Ok(self.vmm.write().unmap_page(virt)?)
    }

    pub fn get_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.read().get_physical(virt)
    }

    pub fn query_flags(&self, virt: VirtualAddress) -> Option<PageEntryBits> {
        self.vmm.read().query_flags(virt)
    }

    pub fn protect(
        &self,
        start: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<usize, MemoryError> {
        Ok(self.vmm.write().protect(start, size, flags)?)
    }

    pub fn map_anonymous(
        &self,
        virt: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let mut vmm = self.vmm.write();
        let mut frames = self.frames.lock();
        Ok(vmm.map_anonymous(&mut *frames, virt, len, flags)?)
    }

    pub fn vmm_stats(&self) -> VmmStats {
        self.vmm.read().stats()
    }

    /// Back `[base, base + size)` with physically contiguous frames, mapped
    /// read-write and non-executable. Returns the physical base.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] or [`MemoryError::InvalidArgument`]; on a
    /// mapping failure the frames are returned.
    pub fn map_heap_window(
        &self,
        base: VirtualAddress,
        size: u64,
    ) -> Result<PhysicalAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument("zero-sized heap window"));
        }
        let pages = usize::try_from(pages_for(size))
            .map_err(|_| MemoryError::InvalidArgument("heap window too large"))?;

        let mut vmm = self.vmm.write();
        let mut frames = self.frames.lock();
        let phys = frames.alloc_pages(pages)?;
        let flags = PageEntryBits::kernel_rw().with_no_execute(true);
        for i in 0..pages as u64 {
            let offset = i * PAGE_SIZE;
            let Some(virt) = base.checked_add(offset) else {
                Self::unmap_window(&mut vmm, base, i);
                frames.free_pages(phys, pages);
                return Err(MemoryError::InvalidArgument("heap window overflows"));
            };
            if let Err(e) = vmm.map_page(&mut *frames, virt, phys + offset, flags) {
                error!("Heap window at {base} could not be mapped: {e}");
                Self::unmap_window(&mut vmm, base, i);
                frames.free_pages(phys, pages);
                return Err(e.into());
            }
        }

        info!("Heap window {base} -> {phys}, {pages} page(s)");
        Ok(phys)
    }

    /// Undo the first `mapped` pages of a heap window.
    fn unmap_window(vmm: &mut Vmm<'m, M, T>, base: VirtualAddress, mapped: u64) {
        for i in 0..mapped {
            // Mapped above; cannot report NotMapped.
            let _ = vmm.unmap_page(base + i * PAGE_SIZE);
        }
    }

    /// Initialize the heap over `[start, start + size)`.
    ///
    /// # Errors
    /// See [`HeapAllocator::init`](crate::heap::HeapAllocator::init).
    ///
    /// # Safety
    /// The range must be mapped writable (see [`map_heap_window`](Self::map_heap_window))
    /// and belong to the heap alone.
    pub unsafe fn init_heap(&self, start: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        Ok(unsafe { self.heap.init(start, size) }?)
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        Ok(self.heap.lock().allocate(size)?)
    }

    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, MemoryError> {
        Ok(self.heap.lock().allocate_zeroed(count, size)?)
    }

    pub fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
        Ok(self.heap.lock().reallocate(ptr, new_size)?)
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        Ok(self.heap.lock().free(ptr)?)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    #[must_use]
    pub const fn heap(&self) -> &LockedHeap {
        &self.heap
    }

    /// Log the state of all three subsystems.
    pub fn log_stats(&self) {
        self.frames.lock().log_layout();
        self.vmm.read().log_stats();
        self.heap.lock().log_stats();
    }
}
