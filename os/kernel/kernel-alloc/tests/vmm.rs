mod common;

use common::{RecordingTlb, SparseRam, all_zero, capture_logs, logged};
use kernel_alloc::{BitmapFrameAlloc, BootLayout, Vmm, VmmError};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::KERNEL_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{NoopTlb, PageEntryBits};
use log::Level;

/// 16 MiB at 16 MiB: 4096 frames, 64 bitmap words.
const REGIONS: [MemoryRegion; 1] = [MemoryRegion::available(0x100_0000, 0x100_0000)];

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

#[test]
fn translation_holds_for_every_offset() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    let v = va(0x0000_7000_0000_0000);
    let p = pa(0x1234_5000);
    vmm.map_page(&mut pmm, v, p, PageEntryBits::kernel_rw()).unwrap();

    for o in 0..4096 {
        assert_eq!(vmm.get_physical(v + o), Some(p + o), "offset {o}");
    }
    assert_eq!(vmm.get_physical(v + 4096), None);
    assert_eq!(tlb.invalidated(), vec![v]);
}

#[test]
fn tables_are_created_once_per_branch() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();
    assert_eq!(pmm.used_frames(), 1);

    let v = va(0xffff_ffff_c000_0000);
    vmm.map_page(&mut pmm, v, pa(0x5000), PageEntryBits::kernel_rw()).unwrap();
    vmm.map_page(&mut pmm, v + 4096, pa(0x6000), PageEntryBits::kernel_rw()).unwrap();

    let s = vmm.stats();
    assert_eq!(s.mapped_pages, 2);
    assert_eq!(s.table_frames, 4);
    assert_eq!(pmm.used_frames(), 4);
    assert_eq!(vmm.address_space().table_count(), 4);
}

#[test]
fn unmap_clears_translation_and_keeps_tables() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    let v = va(0x40_0000);
    let p = pa(0x80_0000);
    vmm.map_page(&mut pmm, v, p, PageEntryBits::kernel_rw()).unwrap();

    assert_eq!(vmm.unmap_page(v), Ok(p));
    assert_eq!(vmm.get_physical(v), None);
    assert!(!vmm.is_mapped(v));
    assert_eq!(tlb.count(), 2);

    assert_eq!(vmm.unmap_page(v), Err(VmmError::NotMapped));
    assert_eq!(vmm.unmap_page(va(0x7fff_0000_0000)), Err(VmmError::NotMapped));
    assert_eq!(tlb.count(), 2);

    let s = vmm.stats();
    assert_eq!(s.mapped_pages, 0);
    assert_eq!(s.table_frames, 4);
}

#[test]
fn bad_addresses_are_rejected() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();
    let f = PageEntryBits::kernel_rw();

    for (v, p) in [
        (0x40_0010, 0x5000),
        (0x40_0000, 0x5008),
        (0x0000_8000_0000_0000, 0x5000),
    ] {
        assert!(matches!(
            vmm.map_page(&mut pmm, va(v), pa(p), f),
            Err(VmmError::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        vmm.unmap_page(va(0x40_0010)),
        Err(VmmError::InvalidArgument(_))
    ));
    assert_eq!(vmm.stats().mapped_pages, 0);
    assert_eq!(vmm.stats().table_frames, 1);
    assert_eq!(tlb.count(), 0);
}

#[test]
fn remapping_overwrites_with_warning() {
    capture_logs();
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    let v = va(0x60_0000);
    vmm.map_page(&mut pmm, v, pa(0x1000), PageEntryBits::kernel_rw()).unwrap();
    vmm.map_page(&mut pmm, v, pa(0x2000), PageEntryBits::kernel_ro()).unwrap();

    assert!(logged(Level::Warn, "remapping"));
    assert_eq!(vmm.get_physical(v), Some(pa(0x2000)));
    assert_eq!(vmm.stats().mapped_pages, 1);
    assert!(!vmm.query_flags(v).unwrap().writable());
}

#[test]
fn leaf_flags_are_kept_and_present_is_forced() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    let user = va(0x1000_0000);
    vmm.map_page(
        &mut pmm,
        user,
        pa(0x3000),
        PageEntryBits::user_rw().with_no_execute(true),
    )
    .unwrap();
    let f = vmm.query_flags(user).unwrap();
    assert!(f.present() && f.writable() && f.user_access() && f.no_execute());
    assert_eq!(f.physical_address(), pa(0));

    let bare = va(0x1000_1000);
    vmm.map_page(&mut pmm, bare, pa(0x4000), PageEntryBits::new()).unwrap();
    let f = vmm.query_flags(bare).unwrap();
    assert!(f.present() && !f.writable() && !f.user_access());
}

#[test]
fn protect_updates_mapped_pages_only() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    let v = va(0x2000_0000);
    vmm.map_page(&mut pmm, v, pa(0xa000), PageEntryBits::kernel_rw()).unwrap();
    vmm.map_page(&mut pmm, v + 0x2000, pa(0xc000), PageEntryBits::kernel_rw()).unwrap();
    tlb.clear();

    // Unaligned on both ends; covers three pages after outward alignment.
    let changed = vmm
        .protect(v + 10, 0x3000 - 20, PageEntryBits::kernel_ro().with_no_execute(true))
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(tlb.invalidated(), vec![v, v + 0x2000]);

    for (page, frame) in [(v, 0xa000), (v + 0x2000, 0xc000)] {
        let f = vmm.query_flags(page).unwrap();
        assert!(f.present() && !f.writable() && f.no_execute());
        assert_eq!(vmm.get_physical(page), Some(pa(frame)));
    }
    assert!(!vmm.is_mapped(v + 0x1000));

    assert_eq!(vmm.protect(v, 0, PageEntryBits::kernel_rw()), Ok(0));
    assert!(matches!(
        vmm.protect(va(0xffff_ffff_ffff_f000), 0x2000, PageEntryBits::kernel_rw()),
        Err(VmmError::InvalidArgument(_))
    ));
}

#[test]
fn bootstrap_maps_identity_window_and_kernel() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    vmm.bootstrap(&mut pmm, &BootLayout::default()).unwrap();

    assert_eq!(vmm.get_physical(va(0)), None);
    assert_eq!(vmm.get_physical(va(0x1000)), Some(pa(0x1000)));
    assert_eq!(vmm.get_physical(va(0x1f_ffff)), Some(pa(0x1f_ffff)));
    assert_eq!(vmm.get_physical(va(0x20_0000)), None);

    assert_eq!(vmm.get_physical(va(KERNEL_BASE + 0x12345)), Some(pa(0x12345)));
    assert_eq!(
        vmm.get_physical(va(KERNEL_BASE + 0xff_ffff)),
        Some(pa(0xff_ffff))
    );
    assert_eq!(vmm.get_physical(va(KERNEL_BASE + 0x100_0000)), None);
    assert!(vmm.query_flags(va(KERNEL_BASE)).unwrap().global_translation());

    // 511 identity pages, 4096 kernel pages; one PT for the identity window,
    // eight for the kernel, plus root and two upper levels each.
    let s = vmm.stats();
    assert_eq!(s.mapped_pages, 511 + 4096);
    assert_eq!(s.table_frames, 14);
    assert_eq!(pmm.used_frames(), 14);
    assert_eq!(vmm.address_space().leaf_count(), s.mapped_pages);
}

#[test]
fn custom_boot_layout() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    let layout = BootLayout {
        identity_bytes: 0,
        kernel_phys_start: 0x20_0000,
        kernel_virt_base: KERNEL_BASE,
        kernel_image_bytes: 0x3000,
    };
    vmm.bootstrap(&mut pmm, &layout).unwrap();
    assert_eq!(vmm.stats().mapped_pages, 3);
    assert_eq!(vmm.get_physical(va(KERNEL_BASE + 0x2008)), Some(pa(0x20_2008)));
}

#[test]
fn anonymous_mapping_uses_fresh_zeroed_frames() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    let v = va(0xffff_ffff_9000_0000);
    vmm.map_anonymous(&mut pmm, v, 3 * 4096 - 1, PageEntryBits::kernel_rw())
        .unwrap();

    let frames: Vec<_> = (0..3)
        .map(|i| vmm.get_physical(v + i * 4096).unwrap())
        .collect();
    assert_ne!(frames[0], frames[1]);
    assert_ne!(frames[1], frames[2]);
    for f in &frames {
        assert!(pmm.is_frame_used(*f));
        assert!(all_zero(&ram.frame(*f)));
    }
    assert_eq!(vmm.get_physical(v + 3 * 4096), None);
}

#[test]
fn table_allocation_failure_is_out_of_memory() {
    capture_logs();
    let ram = SparseRam::new();
    let regions = [MemoryRegion::available(0x10_0000, 5 * 4096)];
    let mut bitmap = vec![0u64; 1];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&regions, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    vmm.map_page(&mut pmm, va(0x1000), pa(0x1000), PageEntryBits::kernel_rw())
        .unwrap();
    // A different PML4 slot needs three new tables; only one frame is left.
    let far = va(0xffff_ffff_8000_0000);
    assert_eq!(
        vmm.map_page(&mut pmm, far, pa(0x2000), PageEntryBits::kernel_rw()),
        Err(VmmError::OutOfMemory)
    );
    assert!(logged(Level::Warn, "no frame available"));
    assert_eq!(vmm.get_physical(far), None);
    assert_eq!(vmm.stats().table_frames, 5);
    assert_eq!(vmm.stats().mapped_pages, 1);
}

#[test]
fn map_range_rounds_length_up() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    let v = va(0x3000_0000);
    vmm.map_range(&mut pmm, v, pa(0x7000_0000), 4097, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.stats().mapped_pages, 2);
    assert_eq!(vmm.get_physical(v + 0x1abc), Some(pa(0x7000_1abc)));
}

#[test]
fn existing_tree_can_be_adopted() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();
    vmm.map_range(&mut pmm, va(0x40_0000), pa(0x40_0000), 0x8000, PageEntryBits::kernel_rw())
        .unwrap();

    let adopted = unsafe { Vmm::from_root(&ram, vmm.root_page(), NoopTlb) };
    assert_eq!(adopted.stats(), vmm.stats());
    assert_eq!(adopted.get_physical(va(0x40_7010)), Some(pa(0x40_7010)));
}

#[test]
fn non_canonical_twins_do_not_alias() {
    let ram = SparseRam::new();
    let tlb = RecordingTlb::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, &tlb, &mut pmm) }.unwrap();

    let canon = va(0xffff_8000_0000_0000);
    let twin = va(0x0000_8000_0000_0000);
    assert_eq!(canon.indices().as_array(), twin.indices().as_array());
    vmm.map_page(&mut pmm, canon, pa(0x50_0000), PageEntryBits::kernel_rw())
        .unwrap();
    tlb.clear();

    assert_eq!(vmm.get_physical(twin), None);
    assert_eq!(vmm.get_physical(twin + 0x10), None);
    assert!(!vmm.is_mapped(twin));
    assert_eq!(vmm.query_flags(twin), None);
    assert!(matches!(vmm.unmap_page(twin), Err(VmmError::InvalidArgument(_))));
    assert!(matches!(
        vmm.protect(twin, 4096, PageEntryBits::kernel_ro()),
        Err(VmmError::InvalidArgument(_))
    ));
    // Crossing from the lower canonical half into the hole.
    assert!(matches!(
        vmm.protect(va(0x0000_7fff_ffff_f000), 0x2000, PageEntryBits::kernel_ro()),
        Err(VmmError::InvalidArgument(_))
    ));

    assert_eq!(vmm.get_physical(canon), Some(pa(0x50_0000)));
    assert!(vmm.query_flags(canon).unwrap().writable());
    assert_eq!(vmm.stats().mapped_pages, 1);
    assert_eq!(tlb.count(), 0);
}

#[test]
fn frames_beyond_52_bits_are_rejected() {
    let ram = SparseRam::new();
    let mut bitmap = vec![0u64; 64];
    let mut pmm = unsafe { BitmapFrameAlloc::new(&REGIONS, &mut bitmap, &ram) }.unwrap();
    let mut vmm = unsafe { Vmm::new(&ram, NoopTlb, &mut pmm) }.unwrap();

    assert_eq!(
        vmm.map_page(&mut pmm, va(0x40_0000), pa(1 << 52), PageEntryBits::kernel_rw()),
        Err(VmmError::InvalidArgument("physical address beyond 52 bits"))
    );

    // The last frame fits; a range running past it is refused up front.
    let top = (1u64 << 52) - 4096;
    assert_eq!(
        vmm.map_range(&mut pmm, va(0x40_0000), pa(top - 4096), 0x3000, PageEntryBits::kernel_rw()),
        Err(VmmError::InvalidArgument("physical address beyond 52 bits"))
    );
    assert_eq!(vmm.stats().mapped_pages, 0);
    assert_eq!(vmm.stats().table_frames, 1);

    vmm.map_page(&mut pmm, va(0x40_0000), pa(top), PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.get_physical(va(0x40_0123)), Some(pa(top + 0x123)));
}
