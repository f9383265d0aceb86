//! # Physical Frame Allocator
//!
//! A bitmap over every 4 KiB frame of the available physical memory.
//!
//! The boot memory map is reduced to a sorted list of disjoint *spans* of
//! available frames. Bitmap index `i` names the `i`-th available frame when
//! the spans are laid end to end, so holes in the physical address space cost
//! no bitmap storage.
//!
//! ```text
//!  physical:  |--span 0--|.....reserved.....|------span 1------|
//!  bitmap:    [0 ........ n0)[n0 .................. n0 + n1)
//! ```
//!
//! A set bit means *used*. Bits past the last tracked frame stay set so the
//! word scan never hands them out.
//!
//! ## Policy
//! - Allocation is first-fit from the lowest frame; contiguous runs never
//!   cross a span boundary.
//! - Every allocated frame is zero-filled through the [`PhysMapper`].
//! - The frame at physical address 0 is never tracked.
//! - Bad frees (misaligned, untracked, already free) are logged and ignored.

use crate::util;
use arrayvec::ArrayVec;
use core::slice;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::MAX_MEMORY_REGIONS;
use kernel_memory_addresses::{
    PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_USIZE, PhysicalAddress, PhysicalPage, align_down,
    checked_align_up,
};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// A run of available, physically contiguous frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameSpan {
    pub first: PhysicalPage,
    pub frames: usize,
    /// Bitmap index of `first`.
    pub index: usize,
}

impl FrameSpan {
    #[inline]
    #[must_use]
    pub const fn end_index(&self) -> usize {
        self.index + self.frames
    }

    #[inline]
    const fn contains_number(&self, number: u64) -> bool {
        number >= self.first.number() && number < self.first.number() + self.frames as u64
    }
}

/// Snapshot of the allocator counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    /// Successful `alloc_page`/`alloc_pages` calls since init.
    pub allocations: u64,
}

type Spans = ArrayVec<FrameSpan, MAX_MEMORY_REGIONS>;

/// Bitmap frame allocator over the boot memory map.
pub struct BitmapFrameAlloc<'m, M: PhysMapper> {
    bitmap: &'m mut [u64],
    spans: Spans,
    regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    total: usize,
    used: usize,
    allocations: u64,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> BitmapFrameAlloc<'m, M> {
    /// Number of `u64` words of bitmap storage needed for `regions`.
    #[must_use]
    pub fn bitmap_words_for(regions: &[MemoryRegion]) -> usize {
        let (_, total) = collect_spans(regions);
        total.div_ceil(64)
    }

    /// Ingest the boot memory map and mark every available frame free.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidArgument`] if `regions` is empty, contains no
    /// usable frame, or `bitmap` is shorter than
    /// [`bitmap_words_for`](Self::bitmap_words_for).
    ///
    /// # Safety
    /// Every frame inside an available region must be RAM that is reachable
    /// and writable through `mapper`, and owned by this allocator from now on.
    pub unsafe fn new(
        regions: &[MemoryRegion],
        bitmap: &'m mut [u64],
        mapper: &'m M,
    ) -> Result<Self, FrameAllocError> {
        if regions.is_empty() {
            return Err(FrameAllocError::InvalidArgument("empty memory map"));
        }

        let (spans, total) = collect_spans(regions);
        if total == 0 {
            return Err(FrameAllocError::InvalidArgument("no available memory"));
        }

        let words = total.div_ceil(64);
        if bitmap.len() < words {
            return Err(FrameAllocError::InvalidArgument("bitmap storage too small"));
        }

        let mut kept = ArrayVec::new();
        for r in regions {
            if kept.try_push(*r).is_err() {
                warn!(
                    "PMM: more than {MAX_MEMORY_REGIONS} memory regions; ignoring {:#x}..{:#x}",
                    r.start,
                    r.end()
                );
            }
        }

        let mut pmm = Self {
            bitmap,
            spans,
            regions: kept,
            total,
            used: 0,
            allocations: 0,
            mapper,
        };

        pmm.bitmap.fill(u64::MAX);
        for idx in 0..total {
            pmm.clear(idx);
        }

        info!(
            "PMM: {} frames ({} KiB) in {} span(s), bitmap {} words",
            total,
            (total as u64 * PAGE_SIZE) / 1024,
            pmm.spans.len(),
            words
        );
        Ok(pmm)
    }

    #[inline]
    fn test(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    fn page_at(&self, idx: usize) -> Option<PhysicalPage> {
        self.spans
            .iter()
            .find(|s| idx >= s.index && idx < s.end_index())
            .map(|s| s.first.step((idx - s.index) as u64))
    }

    /// Span and bitmap index of `page`, if tracked.
    fn locate(&self, page: PhysicalPage) -> Option<(&FrameSpan, usize)> {
        let n = page.number();
        self.spans
            .iter()
            .find(|s| s.contains_number(n))
            .map(|s| (s, s.index + (n - s.first.number()) as usize))
    }

    fn zero_frame(&self, page: PhysicalPage) {
        let ptr = self.mapper.phys_to_ptr(page.base());
        // SAFETY: tracked frames are reachable through the mapper (see `new`)
        // and the frame was just taken, so nothing else refers to it.
        let bytes = unsafe { slice::from_raw_parts_mut(ptr, PAGE_SIZE_USIZE) };
        util::fill_bytes(bytes, 0);
    }

    /// Allocate one zeroed frame, lowest address first.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if every frame is in use.
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        let Some((w, word)) = self
            .bitmap
            .iter()
            .copied()
            .enumerate()
            .find(|&(_, word)| word != u64::MAX)
        else {
            warn!("PMM: out of memory");
            return Err(FrameAllocError::OutOfMemory);
        };

        let idx = w * 64 + (!word).trailing_zeros() as usize;
        let Some(page) = self.page_at(idx) else {
            warn!("PMM: out of memory");
            return Err(FrameAllocError::OutOfMemory);
        };

        self.set(idx);
        self.used += 1;
        self.allocations += 1;
        self.zero_frame(page);
        Ok(page.base())
    }

    /// Allocate `count` physically contiguous zeroed frames (first fit).
    ///
    /// Nothing is allocated on failure.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidArgument`] if `count` is 0.
    /// - [`FrameAllocError::OutOfMemory`] if no run of `count` free frames
    ///   exists, even if enough frames are free in total.
    pub fn alloc_pages(&mut self, count: usize) -> Result<PhysicalAddress, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::InvalidArgument("zero page count"));
        }
        if count == 1 {
            return self.alloc_page();
        }
        if count > self.free_frames() {
            warn!(
                "PMM: {count} pages requested, only {} free",
                self.free_frames()
            );
            return Err(FrameAllocError::OutOfMemory);
        }

        let Some(start) = self.find_run(count) else {
            warn!("PMM: no run of {count} contiguous frames");
            return Err(FrameAllocError::OutOfMemory);
        };

        for idx in start..start + count {
            self.set(idx);
        }
        self.used += count;
        self.allocations += 1;

        let Some(first) = self.page_at(start) else {
            return Err(FrameAllocError::OutOfMemory);
        };
        for i in 0..count as u64 {
            self.zero_frame(first.step(i));
        }

        debug!("PMM: allocated {count} frames at {}", first.base());
        Ok(first.base())
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        for span in &self.spans {
            let mut run = 0;
            for idx in span.index..span.end_index() {
                if self.test(idx) {
                    run = 0;
                    continue;
                }
                run += 1;
                if run == count {
                    return Some(idx + 1 - count);
                }
            }
        }
        None
    }

    /// Validate a free of `count` frames at `addr`; `None` after logging why not.
    fn free_range(&self, addr: PhysicalAddress, count: usize) -> Option<usize> {
        if count == 0 {
            warn!("PMM: free of zero frames at {addr} ignored");
            return None;
        }
        if !addr.is_page_aligned() {
            warn!("PMM: free of unaligned address {addr} ignored");
            return None;
        }
        if addr.as_u64() == 0 {
            warn!("PMM: free of frame 0 ignored");
            return None;
        }
        let Some((span, idx)) = self.locate(addr.page()) else {
            warn!("PMM: free of untracked frame {addr} ignored");
            return None;
        };
        if idx.checked_add(count).is_none_or(|end| end > span.end_index()) {
            warn!("PMM: free of {count} frames at {addr} runs past its region; ignored");
            return None;
        }
        if let Some(free) = (idx..idx + count).find(|&i| !self.test(i)) {
            warn!(
                "PMM: double free of frame {} ignored",
                span.first.step((free - span.index) as u64)
            );
            return None;
        }
        Some(idx)
    }

    /// Return one frame. Anomalies are logged and leave the state unchanged.
    pub fn free_page(&mut self, addr: PhysicalAddress) {
        self.free_pages(addr, 1);
    }

    /// Return `count` contiguous frames starting at `addr`.
    ///
    /// Either all frames are released or, if any of them is invalid or
    /// already free, none are.
    pub fn free_pages(&mut self, addr: PhysicalAddress, count: usize) {
        let Some(idx) = self.free_range(addr, count) else {
            return;
        };
        for i in idx..idx + count {
            self.clear(i);
        }
        self.used -= count;
        debug!("PMM: freed {count} frame(s) at {addr}");
    }

    /// Whether the frame containing `addr` is allocated.
    ///
    /// Untracked frames (reserved, outside the map, frame 0) report `true`.
    #[must_use]
    pub fn is_frame_used(&self, addr: PhysicalAddress) -> bool {
        self.locate(addr.page()).is_none_or(|(_, idx)| self.test(idx))
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.total - self.used
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total,
            used_frames: self.used,
            free_frames: self.free_frames(),
            total_bytes: self.total as u64 * PAGE_SIZE,
            used_bytes: self.used as u64 * PAGE_SIZE,
            free_bytes: self.free_frames() as u64 * PAGE_SIZE,
            allocations: self.allocations,
        }
    }

    /// Set bits among the tracked frames. Equals [`used_frames`](Self::used_frames)
    /// unless the bitmap was corrupted.
    #[must_use]
    pub fn count_used(&self) -> usize {
        (0..self.total).filter(|&i| self.test(i)).count()
    }

    /// The boot regions as ingested.
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The available spans, in address order.
    #[must_use]
    pub fn spans(&self) -> &[FrameSpan] {
        &self.spans
    }

    /// Dump the memory map and counters at info level.
    pub fn log_layout(&self) {
        info!("Physical memory map:");
        for r in &self.regions {
            info!(
                "  {:#014x}-{:#014x} {:>10} KiB  {:<16} {}",
                r.start,
                r.end(),
                r.size / 1024,
                r.kind.as_str(),
                r.label
            );
        }
        for s in &self.spans {
            info!(
                "  span {}..{} -> frames {}..{}",
                s.first.base(),
                s.first.step(s.frames as u64).base(),
                s.index,
                s.end_index()
            );
        }
        let st = self.stats();
        info!(
            "  total {} KiB, used {} KiB, free {} KiB, {} allocations",
            st.total_bytes / 1024,
            st.used_bytes / 1024,
            st.free_bytes / 1024,
            st.allocations
        );
    }
}

impl<M: PhysMapper> FrameAlloc for BitmapFrameAlloc<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.alloc_page().ok().and_then(PhysicalPage::from_aligned)
    }
}

/// Page-align the available regions inward, drop frame 0, sort, merge and
/// number them. Returns the spans and the total frame count.
fn collect_spans(regions: &[MemoryRegion]) -> (Spans, usize) {
    let mut ranges = ArrayVec::<(u64, u64), MAX_MEMORY_REGIONS>::new();
    for r in regions.iter().filter(|r| r.is_available()) {
        let Some(start) = checked_align_up(r.start, PAGE_SIZE) else {
            continue;
        };
        let start = start.max(PAGE_SIZE);
        let end = align_down(r.end(), PAGE_SIZE);
        if end <= start {
            continue;
        }
        if ranges.try_push((start, end)).is_err() {
            warn!("PMM: too many available regions; ignoring {start:#x}..{end:#x}");
        }
    }
    ranges.sort_unstable_by_key(|&(start, _)| start);

    let mut merged = ArrayVec::<(u64, u64), MAX_MEMORY_REGIONS>::new();
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut spans = Spans::new();
    let mut index = 0;
    for (start, end) in merged {
        let frames = ((end - start) >> PAGE_SHIFT) as usize;
        spans.push(FrameSpan {
            first: PhysicalPage::containing(PhysicalAddress::new(start)),
            frames,
            index,
        });
        index += frames;
    }
    (spans, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegionType;

    #[test]
    fn spans_are_aligned_inward_and_skip_frame_zero() {
        let regions = [
            MemoryRegion::available(0, 0x4000),
            MemoryRegion::available(0x10_0800, 0x2000),
        ];
        let (spans, total) = collect_spans(&regions);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].first.base().as_u64(), 0x1000);
        assert_eq!(spans[0].frames, 3);
        // 0x10_0800..0x10_2800 keeps only the full frame at 0x10_1000.
        assert_eq!(spans[1].first.base().as_u64(), 0x10_1000);
        assert_eq!(spans[1].frames, 1);
        assert_eq!(spans[1].index, 3);
        assert_eq!(total, 4);
    }

    #[test]
    fn spans_merge_overlaps_and_ignore_reserved() {
        let regions = [
            MemoryRegion::available(0x20_0000, 0x10_0000),
            MemoryRegion::new(0x10_0000, 0x10_0000, MemoryRegionType::Reserved),
            MemoryRegion::available(0x28_0000, 0x10_0000),
            MemoryRegion::available(0x30_0000, 0x1000),
        ];
        let (spans, total) = collect_spans(&regions);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].first.base().as_u64(), 0x20_0000);
        assert_eq!(total, (0x38_0000 - 0x20_0000) / 4096);
    }

    #[test]
    fn sub_page_regions_vanish() {
        let (spans, total) = collect_spans(&[MemoryRegion::available(0x1001, 0xffe)]);
        assert!(spans.is_empty());
        assert_eq!(total, 0);
    }
}
