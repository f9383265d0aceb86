//! # Kernel Heap
//!
//! A first-fit free-list allocator over one fixed virtual range.
//!
//! Every block starts with a [`HEADER_SIZE`]-byte header followed by its
//! payload. Blocks tile the range without gaps and are linked in address
//! order in both directions:
//!
//! ```text
//! base                                                          base + size
//! +--------+-----------+--------+--------------+--------+-------------+
//! | header |  payload  | header |   payload    | header |   payload   |
//! +--------+-----------+--------+--------------+--------+-------------+
//!     |  next ------------>  |  next --------------->  |  next = NIL
//! ```
//!
//! Links are byte offsets from the heap base rather than pointers, and a
//! header is read as plain integers, so a damaged header can be inspected
//! and rejected without undefined behavior.
//!
//! ## Rules
//! - Payloads are [`HEAP_ALIGN`]-byte aligned and sized in multiples of it.
//! - A block is split only if the leftover, header included, exceeds
//!   [`MIN_BLOCK_SIZE`].
//! - Freed blocks merge with a free successor, then with a free predecessor,
//!   so no two neighbours are ever both free.
//! - The range never grows and blocks are never returned to the VMM.

use crate::util;
use core::ptr::NonNull;
use core::slice;
use kernel_memory_addresses::{PAGE_SIZE_USIZE, checked_align_up_usize};
use log::{debug, error, info, warn};

/// Alignment of every payload.
pub const HEAP_ALIGN: usize = 16;

/// Size of the in-band block header.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Splits leaving this many bytes or fewer (header included) are not made.
pub const MIN_BLOCK_SIZE: usize = 64;

const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;
const STATE_FREE: u32 = 0x4652_4545;
const STATE_USED: u32 = 0x5553_4544;

/// "No block" link.
const NIL: usize = usize::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("heap corruption detected: {0}")]
    CorruptionDetected(&'static str),
}

/// What to do when a damaged header or foreign pointer is found.
///
/// `Report` keeps the kernel running and leaves the heap untouched; the
/// damage may spread through code that ignores the error. `Panic` stops the
/// kernel at the first sign of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Log, refuse the operation and return [`HeapError::CorruptionDetected`].
    Report,
    /// Log and panic.
    Panic,
}

impl CorruptionPolicy {
    /// `Panic` with the `strict-heap` feature, `Report` otherwise.
    pub const DEFAULT: Self = if cfg!(feature = "strict-heap") {
        Self::Panic
    } else {
        Self::Report
    };
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct BlockHeader {
    /// Payload bytes.
    size: usize,
    next: usize,
    prev: usize,
    magic: u32,
    state: u32,
}

const _: () = assert!(size_of::<BlockHeader>() == 32);
const _: () = assert!(HEADER_SIZE.is_multiple_of(HEAP_ALIGN));

impl BlockHeader {
    const fn is_free(&self) -> bool {
        self.state == STATE_FREE
    }

    const fn is_valid(&self) -> bool {
        self.magic == BLOCK_MAGIC && (self.state == STATE_FREE || self.state == STATE_USED)
    }
}

/// Heap counters. `used_bytes + free_bytes == total_bytes`; headers count
/// towards whichever side their block is on.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub allocations: u64,
    pub frees: u64,
    pub free_blocks: usize,
    pub largest_free: usize,
}

/// One block as seen by [`HeapAllocator::blocks`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the heap base.
    pub offset: usize,
    /// Address of the payload.
    pub payload: usize,
    /// Payload bytes.
    pub size: usize,
    pub free: bool,
}

pub struct HeapAllocator {
    base: NonNull<u8>,
    size: usize,
    used: usize,
    allocations: u64,
    frees: u64,
    policy: CorruptionPolicy,
}

// SAFETY: the heap range is owned exclusively by this value; sharing goes
// through a lock (see `LockedHeap`).
unsafe impl Send for HeapAllocator {}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    /// An uninitialized heap; every request fails until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self::with_policy(CorruptionPolicy::DEFAULT)
    }

    #[must_use]
    pub const fn with_policy(policy: CorruptionPolicy) -> Self {
        Self {
            base: NonNull::dangling(),
            size: 0,
            used: 0,
            allocations: 0,
            frees: 0,
            policy,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.size != 0
    }

    #[inline]
    #[must_use]
    pub const fn policy(&self) -> CorruptionPolicy {
        self.policy
    }

    pub const fn set_policy(&mut self, policy: CorruptionPolicy) {
        self.policy = policy;
    }

    /// Take over `[start, start + size)`, `size` rounded up to whole pages, as
    /// one free block. Any previous state is discarded.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] if `size` is 0, the range wraps, or
    /// `start` is not [`HEAP_ALIGN`]-aligned.
    ///
    /// # Safety
    /// The rounded range must be mapped, writable and used by nothing else
    /// for as long as this allocator (or any pointer it returned) is in use.
    pub unsafe fn init(&mut self, start: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized heap"));
        }
        if !start.addr().get().is_multiple_of(HEAP_ALIGN) {
            return Err(HeapError::InvalidArgument("heap start not 16-byte aligned"));
        }
        let size = checked_align_up_usize(size, PAGE_SIZE_USIZE)
            .ok_or(HeapError::InvalidArgument("heap size overflows"))?;
        if start.addr().get().checked_add(size).is_none() {
            return Err(HeapError::InvalidArgument("heap range overflows"));
        }

        if self.is_initialized() {
            warn!("Heap: re-initializing, {} live bytes dropped", self.used);
        }

        self.base = start;
        self.size = size;
        self.used = 0;
        self.allocations = 0;
        self.frees = 0;
        self.write(
            0,
            BlockHeader {
                size: size - HEADER_SIZE,
                next: NIL,
                prev: NIL,
                magic: BLOCK_MAGIC,
                state: STATE_FREE,
            },
        );

        info!("Heap: {} KiB at {:p}", size / 1024, start);
        Ok(())
    }

    #[inline]
    fn header_ptr(&self, off: usize) -> *mut BlockHeader {
        debug_assert!(off + HEADER_SIZE <= self.size);
        // SAFETY: `off` lies inside the heap range.
        unsafe { self.base.as_ptr().add(off).cast() }
    }

    #[inline]
    fn read(&self, off: usize) -> BlockHeader {
        // SAFETY: in range and 16-aligned; any bit pattern is a valid header.
        unsafe { self.header_ptr(off).read() }
    }

    #[inline]
    fn write(&mut self, off: usize, h: BlockHeader) {
        // SAFETY: in range and 16-aligned; the heap owns the range.
        unsafe { self.header_ptr(off).write(h) }
    }

    #[inline]
    fn payload_ptr(&self, off: usize) -> NonNull<u8> {
        // SAFETY: in range, so non-null.
        unsafe { self.base.add(off + HEADER_SIZE) }
    }

    #[allow(clippy::mut_from_ref)]
    fn payload_mut(&self, off: usize, len: usize) -> &mut [u8] {
        // SAFETY: `len` never exceeds the block's payload, which the heap
        // owns; callers hold `&mut self` or have just carved the block.
        unsafe { slice::from_raw_parts_mut(self.payload_ptr(off).as_ptr(), len) }
    }

    /// Log the damage, dump the bytes at `off`, then apply the policy.
    fn corruption(&self, what: &'static str, off: Option<usize>) -> HeapError {
        match off {
            Some(off) => {
                error!("Heap: corruption: {what} (block at offset {off:#x})");
                if off < self.size {
                    let len = HEADER_SIZE.min(self.size - off);
                    // SAFETY: within the heap range.
                    let bytes = unsafe {
                        slice::from_raw_parts(self.base.as_ptr().add(off).cast_const(), len)
                    };
                    util::hexdump(self.base.addr().get() as u64 + off as u64, bytes);
                }
            }
            None => error!("Heap: corruption: {what}"),
        }

        match self.policy {
            CorruptionPolicy::Report => HeapError::CorruptionDetected(what),
            CorruptionPolicy::Panic => panic!("heap corruption: {what}"),
        }
    }

    /// Read the header at `off` while walking the list, checking it for damage.
    fn read_linked(&self, off: usize, prev: usize) -> Result<BlockHeader, HeapError> {
        if off.checked_add(HEADER_SIZE).is_none_or(|end| end > self.size) {
            return Err(self.corruption("link outside heap", None));
        }
        let h = self.read(off);
        if !h.is_valid() {
            return Err(self.corruption("bad block tag", Some(off)));
        }
        if h.prev != prev {
            return Err(self.corruption("broken back link", Some(off)));
        }
        if !self.size_fits(off, h.size) {
            return Err(self.corruption("block size out of range", Some(off)));
        }
        let end = off + HEADER_SIZE + h.size;
        let chained = if h.next == NIL { end == self.size } else { h.next == end };
        if !chained {
            return Err(self.corruption("block size does not match its link", Some(off)));
        }
        Ok(h)
    }

    /// Whether a block at `off` with `size` payload bytes ends inside the heap
    /// and keeps the next header aligned.
    const fn size_fits(&self, off: usize, size: usize) -> bool {
        off + HEADER_SIZE <= self.size
            && size <= self.size - off - HEADER_SIZE
            && size.is_multiple_of(HEAP_ALIGN)
    }

    /// Locate and validate the header of a pointer handed out by `allocate`.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<(usize, BlockHeader), HeapError> {
        if !self.is_initialized() {
            return Err(HeapError::InvalidArgument("heap not initialized"));
        }
        let base = self.base.addr().get();
        let addr = ptr.addr().get();
        if addr < base + HEADER_SIZE || addr >= base + self.size {
            return Err(self.corruption("pointer outside heap", None));
        }
        if !(addr - base).is_multiple_of(HEAP_ALIGN) {
            return Err(self.corruption("misaligned heap pointer", None));
        }
        let off = addr - base - HEADER_SIZE;
        let h = self.read(off);
        if !h.is_valid() || !self.size_fits(off, h.size) {
            return Err(self.corruption("bad block tag", Some(off)));
        }
        Ok((off, h))
    }

    /// Check that a link read from a header names an intact block.
    fn check_neighbour(&self, link: usize) -> Result<(), HeapError> {
        if link == NIL {
            return Ok(());
        }
        if !link.is_multiple_of(HEAP_ALIGN) || link.checked_add(HEADER_SIZE).is_none_or(|end| end > self.size) {
            return Err(self.corruption("link outside heap", None));
        }
        let n = self.read(link);
        if !n.is_valid() || !self.size_fits(link, n.size) {
            return Err(self.corruption("bad neighbour tag", Some(link)));
        }
        Ok(())
    }

    /// Allocate `size` zeroed bytes, [`HEAP_ALIGN`]-aligned.
    ///
    /// # Errors
    /// - [`HeapError::InvalidArgument`] for `size == 0` or an uninitialized heap.
    /// - [`HeapError::OutOfMemory`] if no free block is large enough.
    /// - [`HeapError::CorruptionDetected`] if the block list is damaged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized allocation"));
        }
        if !self.is_initialized() {
            return Err(HeapError::InvalidArgument("heap not initialized"));
        }
        let need = checked_align_up_usize(size, HEAP_ALIGN).ok_or(HeapError::OutOfMemory)?;

        let mut off = 0;
        let mut prev = NIL;
        while off != NIL {
            let mut h = self.read_linked(off, prev)?;
            if h.is_free() && h.size >= need {
                let rest = h.size - need;
                if rest > MIN_BLOCK_SIZE {
                    let split = off + HEADER_SIZE + need;
                    self.write(
                        split,
                        BlockHeader {
                            size: rest - HEADER_SIZE,
                            next: h.next,
                            prev: off,
                            magic: BLOCK_MAGIC,
                            state: STATE_FREE,
                        },
                    );
                    if h.next != NIL {
                        let mut n = self.read(h.next);
                        n.prev = split;
                        self.write(h.next, n);
                    }
                    h.size = need;
                    h.next = split;
                }
                h.state = STATE_USED;
                self.write(off, h);

                self.used += HEADER_SIZE + h.size;
                self.allocations += 1;
                util::fill_bytes(self.payload_mut(off, h.size), 0);
                return Ok(self.payload_ptr(off));
            }
            prev = off;
            off = h.next;
        }

        warn!("Heap: out of memory for {size} bytes");
        Err(HeapError::OutOfMemory)
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] if the product overflows, otherwise as
    /// [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let total = count
            .checked_mul(size)
            .ok_or(HeapError::InvalidArgument("size overflows"))?;
        self.allocate(total)
    }

    /// Resize the allocation at `ptr`.
    ///
    /// Returns `ptr` itself if `new_size` fits in the current block; otherwise
    /// moves the contents to a new block and frees the old one. On error the
    /// old block is untouched.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] for `new_size == 0` or a block that is
    /// not allocated, plus everything [`allocate`](Self::allocate) and
    /// [`free`](Self::free) report.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        if new_size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized reallocation"));
        }
        let (off, h) = self.block_of(ptr)?;
        if h.is_free() {
            return Err(HeapError::InvalidArgument("reallocation of a free block"));
        }
        if new_size <= h.size {
            return Ok(ptr);
        }

        let new = self.allocate(new_size)?;
        let new_off = new.addr().get() - self.base.addr().get() - HEADER_SIZE;
        // SAFETY: distinct live blocks never overlap.
        let src = unsafe { slice::from_raw_parts(self.payload_ptr(off).as_ptr().cast_const(), h.size) };
        util::copy_bytes(self.payload_mut(new_off, new_size), src);
        self.free(ptr)?;
        Ok(new)
    }

    /// Release the block at `ptr` and merge it with free neighbours.
    ///
    /// A second free of the same block is logged and ignored.
    ///
    /// # Errors
    /// [`HeapError::CorruptionDetected`] if `ptr` is not a heap pointer or its
    /// header is damaged; the heap is left as it was.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let (mut off, mut h) = self.block_of(ptr)?;
        if h.is_free() {
            warn!("Heap: double free of {ptr:p} ignored");
            return Ok(());
        }
        self.check_neighbour(h.next)?;
        self.check_neighbour(h.prev)?;

        self.used -= HEADER_SIZE + h.size;
        self.frees += 1;
        h.state = STATE_FREE;

        while h.next != NIL {
            let n = self.read(h.next);
            if !n.is_valid() || !n.is_free() {
                break;
            }
            self.retire(h.next);
            h.size += HEADER_SIZE + n.size;
            h.next = n.next;
        }

        while h.prev != NIL {
            let mut p = self.read(h.prev);
            if !p.is_valid() || !p.is_free() {
                break;
            }
            self.retire(off);
            p.size += HEADER_SIZE + h.size;
            p.next = h.next;
            off = h.prev;
            h = p;
        }

        self.write(off, h);
        if h.next != NIL {
            let mut n = self.read(h.next);
            n.prev = off;
            self.write(h.next, n);
        }
        Ok(())
    }

    /// Clear the tag of a header absorbed by its neighbour.
    fn retire(&mut self, off: usize) {
        let mut h = self.read(off);
        h.magic = 0;
        h.state = 0;
        self.write(off, h);
    }

    /// Payload capacity of the block at `ptr`.
    ///
    /// # Errors
    /// As [`free`](Self::free) for pointers that are not heap blocks.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.block_of(ptr).map(|(_, h)| h.size)
    }

    /// Iterate over the blocks in address order. Stops early at a damaged
    /// header.
    #[must_use]
    pub const fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            next: if self.size == 0 { NIL } else { 0 },
        }
    }

    /// Walk the whole list and verify tiling, links, tags, coalescing and
    /// the used-byte counter.
    ///
    /// # Errors
    /// [`HeapError::CorruptionDetected`] describing the first problem found.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        if !self.is_initialized() {
            return Ok(());
        }
        let mut off = 0;
        let mut prev = NIL;
        let mut prev_free = false;
        let mut used = 0;
        while off != NIL {
            let h = self.read_linked(off, prev)?;
            if h.is_free() && prev_free {
                return Err(self.corruption("adjacent free blocks", Some(off)));
            }
            if !h.is_free() {
                used += HEADER_SIZE + h.size;
            }
            prev_free = h.is_free();
            prev = off;
            off = h.next;
        }
        if used != self.used {
            return Err(self.corruption("used-byte counter out of sync", None));
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let (free_blocks, largest_free) = self
            .blocks()
            .filter(|b| b.free)
            .fold((0, 0), |(n, max), b| (n + 1, max.max(b.size)));
        HeapStats {
            total_bytes: self.size,
            used_bytes: self.used,
            free_bytes: self.size - self.used,
            allocations: self.allocations,
            frees: self.frees,
            free_blocks,
            largest_free,
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "Heap: {} of {} bytes used, {} free in {} block(s), largest {}",
            s.used_bytes, s.total_bytes, s.free_bytes, s.free_blocks, s.largest_free
        );
        info!("Heap: {} allocations, {} frees", s.allocations, s.frees);
        for b in self.blocks() {
            debug!(
                "  {:#x}: {:>8} bytes {}",
                b.payload,
                b.size,
                if b.free { "free" } else { "used" }
            );
        }
    }
}

/// Iterator returned by [`HeapAllocator::blocks`].
pub struct Blocks<'a> {
    heap: &'a HeapAllocator,
    next: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let off = self.next;
        if off == NIL || off.checked_add(HEADER_SIZE).is_none_or(|end| end > self.heap.size) {
            return None;
        }
        let h = self.heap.read(off);
        if !h.is_valid() {
            self.next = NIL;
            return None;
        }
        self.next = h.next;
        Some(BlockInfo {
            offset: off,
            payload: self.heap.payload_ptr(off).addr().get(),
            size: h.size,
            free: h.is_free(),
        })
    }
}
