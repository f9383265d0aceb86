//! Byte helpers shared by the allocators.

use arrayvec::ArrayString;
use core::cmp::Ordering;
use core::fmt::Write;
use core::sync::atomic::{Ordering as AtomicOrdering, compiler_fence};
use log::debug;

pub use kernel_memory_addresses::{align_down, align_up, is_aligned};

/// Copy as many bytes as both slices hold. Returns the count copied.
///
/// ```rust
/// # use kernel_alloc::util::copy_bytes;
/// let mut dst = [0u8; 4];
/// assert_eq!(copy_bytes(&mut dst, b"abcdef"), 4);
/// assert_eq!(&dst, b"abcd");
/// ```
pub fn copy_bytes(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// Copy `len` bytes at `src` to `dst` inside `buf`. The ranges may overlap.
///
/// Returns `false` without touching `buf` if either range is out of bounds.
///
/// ```rust
/// # use kernel_alloc::util::move_within;
/// let mut buf = *b"abcdef";
/// assert!(move_within(&mut buf, 0, 2, 4));
/// assert_eq!(&buf, b"ababcd");
/// assert!(!move_within(&mut buf, 4, 0, 3));
/// ```
pub fn move_within(buf: &mut [u8], src: usize, dst: usize, len: usize) -> bool {
    let fits = |at: usize| at.checked_add(len).is_some_and(|end| end <= buf.len());
    if !fits(src) || !fits(dst) {
        return false;
    }
    buf.copy_within(src..src + len, dst);
    true
}

pub fn fill_bytes(buf: &mut [u8], value: u8) {
    buf.fill(value);
}

/// Lexicographic comparison; a proper prefix orders first.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

pub fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Zero `buf` with volatile stores that the optimizer may not elide.
pub fn zero_secure(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        // SAFETY: `b` is a valid, exclusive reference.
        unsafe { core::ptr::write_volatile(b, 0) };
    }
    compiler_fence(AtomicOrdering::SeqCst);
}

#[must_use]
pub fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Additive checksum, rotated left by one bit after every byte.
///
/// ```rust
/// # use kernel_alloc::util::checksum;
/// assert_eq!(checksum(&[]), 0);
/// assert_eq!(checksum(&[1]), 2);
/// assert_eq!(checksum(&[1, 1]), 6);
/// ```
#[must_use]
pub fn checksum(buf: &[u8]) -> u32 {
    buf.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)).rotate_left(1))
}

/// Log `bytes` at debug level, 16 per line, labelled from `base`.
pub fn hexdump(base: u64, bytes: &[u8]) {
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let mut hex = ArrayString::<48>::new();
        let mut ascii = ArrayString::<16>::new();
        for &b in chunk {
            let _ = write!(hex, "{b:02x} ");
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            let _ = ascii.try_push(c);
        }
        let at = base.wrapping_add(line as u64 * 16);
        debug!("{at:016x}: {hex:<48} |{ascii}|");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_within_handles_overlap_both_ways() {
        let mut buf = *b"0123456789";
        assert!(move_within(&mut buf, 2, 0, 5));
        assert_eq!(&buf, b"2345656789");

        let mut buf = *b"0123456789";
        assert!(move_within(&mut buf, 0, 3, 5));
        assert_eq!(&buf, b"0120123489");
    }

    #[test]
    fn move_within_rejects_overflowing_ranges() {
        let mut buf = [7u8; 8];
        assert!(!move_within(&mut buf, usize::MAX, 0, 2));
        assert!(!move_within(&mut buf, 0, 7, 2));
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn compare_and_find() {
        assert_eq!(compare_bytes(b"abc", b"abd"), Ordering::Less);
        assert_eq!(compare_bytes(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(compare_bytes(b"abcd", b"abc"), Ordering::Greater);
        assert_eq!(find_byte(b"hello", b'l'), Some(2));
        assert_eq!(find_byte(b"hello", b'z'), None);
    }

    #[test]
    fn zeroing_helpers() {
        let mut buf = [0x5Au8; 33];
        assert!(!is_zero(&buf));
        zero_secure(&mut buf);
        assert!(is_zero(&buf));
        fill_bytes(&mut buf[..3], 1);
        assert_eq!(&buf[..4], &[1, 1, 1, 0]);
    }

    #[test]
    fn checksum_is_order_sensitive() {
        assert_ne!(checksum(b"ab"), checksum(b"ba"));
    }

    #[test]
    fn hexdump_accepts_partial_lines() {
        hexdump(0x1000, &[0u8; 0]);
        hexdump(0x1000, b"0123456789abcdefXYZ\n\0");
    }
}
