//! Translation-cache maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Invalidates cached translations after the page tables change.
pub trait TlbFlush {
    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop all non-global cached translations.
    fn flush_all(&self);
}

impl<T: TlbFlush + ?Sized> TlbFlush for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    #[inline]
    fn flush_all(&self) {
        (**self).flush_all();
    }
}

/// For trees that are not loaded in CR3 yet.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopTlb;

impl TlbFlush for NoopTlb {
    #[inline]
    fn invalidate_page(&self, _va: VirtualAddress) {}

    #[inline]
    fn flush_all(&self) {}
}

/// `invlpg` / CR3 reload on the executing CPU.
///
/// Requires CPL0.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareTlb;

#[cfg(target_arch = "x86_64")]
impl TlbFlush for HardwareTlb {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_all(&self) {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }
}
