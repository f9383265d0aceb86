//! Host stand-ins for physical memory, the TLB and the console logger.

#![allow(dead_code)]

use kernel_alloc::util;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{PhysMapper, TlbFlush};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Once;

/// Pattern fresh simulated RAM is filled with, so zeroing is observable.
pub const GARBAGE: u8 = 0xA5;

#[repr(C, align(4096))]
pub struct Frame(pub [u8; 4096]);

/// Sparse physical memory: a frame is materialized on first access.
///
/// Frames never move once created, so pointers stay valid for the life of
/// the `SparseRam`.
#[derive(Default)]
pub struct SparseRam {
    frames: RefCell<BTreeMap<u64, Box<Frame>>>,
}

impl SparseRam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames touched so far.
    pub fn touched(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let p = self.phys_to_ptr(pa);
        assert!(pa.page_offset() as usize + bytes.len() <= 4096);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
    }

    pub fn frame(&self, pa: PhysicalAddress) -> Vec<u8> {
        let p = self.phys_to_ptr(pa.page().base());
        unsafe { std::slice::from_raw_parts(p, 4096) }.to_vec()
    }
}

impl PhysMapper for SparseRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let mut frames = self.frames.borrow_mut();
        let frame = frames
            .entry(pa.frame_number())
            .or_insert_with(|| Box::new(Frame([GARBAGE; 4096])));
        let base: *mut Frame = &mut **frame;
        unsafe { base.cast::<u8>().add(pa.page_offset() as usize) }
    }
}

/// Contiguous physical memory `[base, base + frames * 4096)`, for tests that
/// need a byte range spanning several frames (the heap window).
pub struct ContiguousRam {
    base: u64,
    ptr: NonNull<u8>,
    len: usize,
    _storage: Vec<Frame>,
}

impl ContiguousRam {
    pub fn new(base: u64, frames: usize) -> Self {
        let mut storage = Vec::with_capacity(frames);
        storage.resize_with(frames, || Frame([GARBAGE; 4096]));
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).expect("vec pointer");
        Self {
            base,
            ptr,
            len: frames * 4096,
            _storage: storage,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    /// Host pointer for `pa`.
    pub fn host(&self, pa: PhysicalAddress) -> NonNull<u8> {
        NonNull::new(self.phys_to_ptr(pa)).expect("in range")
    }

    pub fn bytes(&self, pa: PhysicalAddress, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.phys_to_ptr(pa), len) }
    }
}

impl PhysMapper for ContiguousRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let off = pa
            .as_u64()
            .checked_sub(self.base)
            .filter(|&off| off < self.len as u64)
            .unwrap_or_else(|| panic!("{pa} outside simulated RAM"));
        unsafe { self.ptr.as_ptr().add(off as usize) }
    }
}

/// A page-aligned host buffer for heap tests.
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
    _storage: Vec<Frame>,
}

impl Arena {
    pub fn new(bytes: usize) -> Self {
        let frames = bytes.div_ceil(4096);
        let mut storage = Vec::with_capacity(frames);
        storage.resize_with(frames, || Frame([GARBAGE; 4096]));
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).expect("vec pointer");
        Self {
            ptr,
            len: frames * 4096,
            _storage: storage,
        }
    }

    pub fn start(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, p: NonNull<u8>) -> bool {
        let a = p.as_ptr() as usize;
        let s = self.ptr.as_ptr() as usize;
        a >= s && a < s + self.len
    }
}

/// Records every invalidation instead of executing `invlpg`.
#[derive(Default)]
pub struct RecordingTlb {
    pages: RefCell<Vec<VirtualAddress>>,
    full: RefCell<usize>,
}

impl RecordingTlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidated(&self) -> Vec<VirtualAddress> {
        self.pages.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.pages.borrow().len()
    }

    pub fn clear(&self) {
        self.pages.borrow_mut().clear();
    }
}

impl TlbFlush for RecordingTlb {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.pages.borrow_mut().push(va);
    }

    fn flush_all(&self) {
        *self.full.borrow_mut() += 1;
    }
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// `log` backend that keeps each test thread's records apart.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let line = format!("{}", record.args());
        CAPTURED.with(|c| c.borrow_mut().push((record.level(), line)));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INIT: Once = Once::new();

/// Install the capturing logger (once per process) and clear this thread's
/// records.
pub fn capture_logs() {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).expect("logger already set");
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURED.with(|c| c.borrow_mut().clear());
}

/// Whether this thread logged a record at `level` containing `needle`.
pub fn logged(level: Level, needle: &str) -> bool {
    CAPTURED.with(|c| {
        c.borrow()
            .iter()
            .any(|(l, msg)| *l == level && msg.contains(needle))
    })
}

pub fn records_at(level: Level) -> usize {
    CAPTURED.with(|c| c.borrow().iter().filter(|(l, _)| *l == level).count())
}

/// The byte helpers double as test assertions.
pub fn all_zero(bytes: &[u8]) -> bool {
    util::is_zero(bytes)
}
