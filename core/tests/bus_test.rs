use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use intuition_core::core::bus::{MEM_SIZE, MemoryBus, VIDEO_STATUS};

mod common;

// =============================================================================
// RAM plane
// =============================================================================

#[test]
fn test_ram_roundtrip_32() {
    let bus = common::ram_bus();
    for addr in [0u32, 0x1000, 0x9F000 - 4, 0x123457, MEM_SIZE as u32 - 4] {
        bus.write32(addr, 0xCAFE0000 | addr);
        assert_eq!(bus.read32(addr), 0xCAFE0000 | addr);
    }
}

#[test]
fn test_ram_roundtrip_widths() {
    let bus = common::ram_bus();
    bus.write8(0x2000, 0xAB);
    assert_eq!(bus.read8(0x2000), 0xAB);
    bus.write16(0x2002, 0xBEEF);
    assert_eq!(bus.read16(0x2002), 0xBEEF);
    bus.write64(0x2008, 0x0123_4567_89AB_CDEF);
    assert_eq!(bus.read64(0x2008), 0x0123_4567_89AB_CDEF);
}

#[test]
fn test_ram_little_endian_layout() {
    let bus = common::ram_bus();
    bus.write32(0x3000, 0xCAFEBABE);
    assert_eq!(bus.read8(0x3000), 0xBE);
    assert_eq!(bus.read8(0x3001), 0xBA);
    assert_eq!(bus.read8(0x3002), 0xFE);
    assert_eq!(bus.read8(0x3003), 0xCA);
}

#[test]
fn test_unaligned_ram_access() {
    let bus = common::ram_bus();
    bus.write32(0x4001, 0x11223344);
    assert_eq!(bus.read32(0x4001), 0x11223344);
    bus.write64(0x4103, 0x5566_7788_99AA_BBCC);
    assert_eq!(bus.read64(0x4103), 0x5566_7788_99AA_BBCC);
}

#[test]
fn test_read64_composes_from_halves() {
    let bus = common::ram_bus();
    for addr in [0u32, 0x1234, 0x100000, MEM_SIZE as u32 - 8] {
        bus.write64(addr, 0xDEAD_BEEF_0BAD_F00D ^ addr as u64);
        let lo = bus.read32(addr) as u64;
        let hi = bus.read32(addr + 4) as u64;
        assert_eq!(bus.read64(addr), lo | (hi << 32));
    }
}

#[test]
fn test_reset_zeroes_ram() {
    let bus = common::ram_bus();
    bus.write32(0x5000, 0xFFFF_FFFF);
    bus.reset();
    assert_eq!(bus.read32(0x5000), 0);
}

// =============================================================================
// Bounds
// =============================================================================

#[test]
fn test_out_of_bounds_reads_zero() {
    let bus = common::ram_bus();
    assert_eq!(bus.read32(MEM_SIZE as u32), 0);
    assert_eq!(bus.read32(MEM_SIZE as u32 - 2), 0); // straddles the end
    assert_eq!(bus.read8(0x4000_0000), 0);
}

#[test]
fn test_out_of_bounds_write_is_dropped() {
    let bus = common::ram_bus();
    bus.write32(MEM_SIZE as u32 - 2, 0x12345678);
    assert_eq!(bus.read16(MEM_SIZE as u32 - 2), 0);
}

#[test]
fn test_with_fault_reports_bounds() {
    let bus = common::ram_bus();
    assert_eq!(bus.read32_with_fault(MEM_SIZE as u32), (0, false));
    assert!(!bus.write32_with_fault(MEM_SIZE as u32 - 1, 1));
    assert_eq!(bus.read64_with_fault(MEM_SIZE as u32 - 4), (0, false));
    assert_eq!(bus.read32_with_fault(0x1000), (0, true));
}

// =============================================================================
// MMIO dispatch
// =============================================================================

fn logging_region(bus: &MemoryBus, start: u32, end: u32) -> Arc<Mutex<Vec<(u32, u32)>>> {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let log = writes.clone();
    bus.map_io(
        start,
        end,
        Box::new(move |addr| 0x5500_0000 | addr),
        Box::new(move |addr, val| log.lock().unwrap().push((addr, val))),
    );
    writes
}

#[test]
fn test_mmio_write_dispatches_to_handler() {
    let bus = MemoryBus::new();
    let writes = logging_region(&bus, 0xB0000, 0xB00FF);
    bus.seal_mappings();

    bus.write32(0xB0010, 0x1234);
    assert_eq!(*writes.lock().unwrap(), vec![(0xB0010, 0x1234)]);
}

#[test]
fn test_mmio_read_dispatches_and_mirrors() {
    let bus = MemoryBus::new();
    let _writes = logging_region(&bus, 0xB0000, 0xB00FF);
    bus.seal_mappings();

    assert_eq!(bus.read32(0xB0020), 0x5500_0000 | 0xB0020);
    // The dispatched value is mirrored into backing RAM.
    let ram = bus.ram();
    let mirrored = u32::from_le_bytes(ram[0xB0020..0xB0024].try_into().unwrap());
    assert_eq!(mirrored, 0x5500_0000 | 0xB0020);
}

#[test]
fn test_unmapped_page_stays_on_fast_path() {
    let bus = MemoryBus::new();
    let writes = logging_region(&bus, 0xB0000, 0xB00FF);
    bus.seal_mappings();

    // Next page over: plain RAM, handler untouched.
    bus.write32(0xB0100, 0xABCD);
    assert_eq!(bus.read32(0xB0100), 0xABCD);
    assert!(writes.lock().unwrap().is_empty());
}

#[test]
fn test_mmio_region_bounds_within_page() {
    let bus = MemoryBus::new();
    let writes = logging_region(&bus, 0xB0000, 0xB003F);
    bus.seal_mappings();

    // Same page, past the region end: plain RAM.
    bus.write32(0xB0040, 7);
    assert_eq!(bus.read32(0xB0040), 7);
    assert!(writes.lock().unwrap().is_empty());
}

#[test]
fn test_mmio_sub_word_write_merges_lane() {
    let bus = MemoryBus::new();
    let writes = logging_region(&bus, 0xB0000, 0xB00FF);
    bus.seal_mappings();

    bus.write32(0xB0030, 0xAABBCCDD);
    bus.write8(0xB0031, 0x11);
    let log = writes.lock().unwrap();
    // Second write presents the merged word at the aligned address.
    assert_eq!(log[1], (0xB0030, 0xAABB11DD));
}

#[test]
fn test_multiple_regions_first_match_wins() {
    let bus = MemoryBus::new();
    let first = logging_region(&bus, 0xB0000, 0xB000F);
    let second = logging_region(&bus, 0xB0000, 0xB00FF);
    bus.seal_mappings();

    bus.write32(0xB0008, 1);
    bus.write32(0xB0080, 2);
    assert_eq!(*first.lock().unwrap(), vec![(0xB0008, 1)]);
    assert_eq!(*second.lock().unwrap(), vec![(0xB0080, 2)]);
}

// =============================================================================
// Sign-extended mirror
// =============================================================================

#[test]
fn test_sign_extended_mirror_dispatches() {
    let bus = MemoryBus::new();
    let writes = logging_region(&bus, 0x8000, 0x80FF);
    bus.seal_mappings();

    // The mirror folds to the low 64 KiB before dispatch.
    bus.write32(0xFFFF_8010, 0x42);
    assert_eq!(*writes.lock().unwrap(), vec![(0x8010, 0x42)]);
    assert_eq!(bus.read32(0xFFFF_8010), 0x5500_8010);
    // The normal-range alias dispatches too.
    assert_eq!(bus.read32(0x8010), 0x5500_8010);
}

#[test]
fn test_sign_extended_unmapped_falls_to_ram() {
    let bus = common::ram_bus();
    bus.write32(0xFFFF_9000, 0x77);
    assert_eq!(bus.read32(0x9000), 0x77);
    assert_eq!(bus.read32(0xFFFF_9000), 0x77);
}

#[test]
fn test_mirror_excludes_regions_below_the_band() {
    let bus = MemoryBus::new();
    // Starts below 0x8000: no sign-extended alias.
    let writes = logging_region(&bus, 0x4000, 0x40FF);
    bus.seal_mappings();

    bus.write32(0x4000, 1);
    bus.write32(0xFFFF_4000, 2);
    // Only the direct access dispatched; the alias fell through to RAM.
    assert_eq!(*writes.lock().unwrap(), vec![(0x4000, 1)]);
    assert_eq!(bus.read32(0xFFFF_4000), 2);
    // The direct address still dispatches.
    assert_eq!(bus.read32(0x4000), 0x5500_4000);
}

#[test]
fn test_mirror_excludes_io64_regions_below_the_band() {
    let bus = MemoryBus::new();
    let seen = Arc::new(Mutex::new(0u64));
    let s = seen.clone();
    bus.map_io64(
        0x4000,
        0x4007,
        Box::new(|_| 0),
        Box::new(move |_, val| *s.lock().unwrap() = val),
    );
    bus.seal_mappings();

    bus.write64(0xFFFF_4000, 0x0123_4567_89AB_CDEF);
    assert_eq!(*seen.lock().unwrap(), 0);
    // The alias landed in plain RAM instead.
    assert_eq!(bus.read64(0xFFFF_4000), 0x0123_4567_89AB_CDEF);
}

// =============================================================================
// Video status fast path
// =============================================================================

#[test]
fn test_video_status_reader() {
    let bus = MemoryBus::new();
    let status = Arc::new(AtomicU32::new(0));
    let s = status.clone();
    bus.set_video_status_reader(Box::new(move || s.load(Ordering::Acquire)));
    bus.seal_mappings();

    assert_eq!(bus.read32(VIDEO_STATUS), 0);
    status.store(1, Ordering::Release);
    assert_eq!(bus.read32(VIDEO_STATUS), 1);
}

#[test]
fn test_video_status_without_reader_is_ram() {
    let bus = common::ram_bus();
    bus.write32(VIDEO_STATUS, 0xAA);
    assert_eq!(bus.read32(VIDEO_STATUS), 0xAA);
}

// =============================================================================
// Sealing
// =============================================================================

#[test]
fn test_seal_is_idempotent() {
    let bus = MemoryBus::new();
    bus.seal_mappings();
    bus.seal_mappings();
    assert!(bus.is_sealed());
}

#[test]
#[should_panic(expected = "map_io after seal_mappings")]
fn test_map_io_after_seal_panics() {
    let bus = MemoryBus::new();
    bus.seal_mappings();
    bus.map_io(0xB0000, 0xB00FF, Box::new(|_| 0), Box::new(|_, _| {}));
}

#[test]
#[should_panic(expected = "map_io64 after seal_mappings")]
fn test_map_io64_after_seal_panics() {
    let bus = MemoryBus::new();
    bus.seal_mappings();
    bus.map_io64(0xB0000, 0xB00FF, Box::new(|_| 0), Box::new(|_, _| {}));
}
