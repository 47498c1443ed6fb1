use intuition_core::cpu::Ie64;
use intuition_core::cpu::ie64::opcodes::*;

mod common;
use common::{prog, ram_bus, ri, rr, run_program, sys};

// =============================================================================
// Program loading
// =============================================================================

#[test]
fn test_loaded_program_visible_through_bus() {
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    let mut image = vec![0u8; 12];
    image[8..12].copy_from_slice(&[0xBE, 0xBA, 0xFE, 0xCA]);
    cpu.load_program(&image);
    assert_eq!(bus.read32(0x1008), 0xCAFE_BABE);
}

#[test]
fn test_load_program_zeroes_previous_image() {
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    cpu.load_program(&[0xFF; 64]);
    cpu.load_program(&[0x11; 8]);
    assert_eq!(bus.read8(0x1000), 0x11);
    assert_eq!(bus.read8(0x1008), 0);
    assert_eq!(bus.read8(0x103F), 0);
}

#[test]
#[should_panic(expected = "exceeds")]
fn test_load_program_too_large_panics() {
    let mut cpu = Ie64::new(ram_bus());
    let image = vec![0u8; 0x9F000 - 0x1000 + 1];
    cpu.load_program(&image);
}

// =============================================================================
// Loads and stores
// =============================================================================

#[test]
fn test_store_load_round_trip() {
    let cpu = run_program(&[
        ri(OP_MOVE, OpSize::Quad, 1, 0, 0x2000),
        ri(OP_MOVE, OpSize::Long, 2, 0, 0xCAFE_F00D),
        encode(OP_STORE, 2, OpSize::Long, true, 1, 0, 0x10), // (R1 + 0x10)
        encode(OP_LOAD, 3, OpSize::Long, true, 1, 0, 0x10),
        sys(OP_HALT),
    ]);
    assert_eq!(cpu.regs[3], 0xCAFE_F00D);
}

#[test]
fn test_store_widths_little_endian() {
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    cpu.load_program(&prog(&[
        ri(OP_MOVE, OpSize::Long, 1, 0, 0x1122_3344),
        encode(OP_STORE, 1, OpSize::Byte, true, 0, 0, 0x3000),
        encode(OP_STORE, 1, OpSize::Word, true, 0, 0, 0x3004),
        encode(OP_STORE, 1, OpSize::Long, true, 0, 0, 0x3008),
        sys(OP_HALT),
    ]));
    cpu.execute();
    assert_eq!(bus.read32(0x3000), 0x44);
    assert_eq!(bus.read32(0x3004), 0x3344);
    assert_eq!(bus.read32(0x3008), 0x1122_3344);
}

#[test]
fn test_load_zero_extends() {
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    cpu.load_program(&prog(&[
        encode(OP_LOAD, 1, OpSize::Byte, true, 0, 0, 0x3000),
        encode(OP_LOAD, 2, OpSize::Word, true, 0, 0, 0x3000),
        encode(OP_LOAD, 3, OpSize::Long, true, 0, 0, 0x3000),
        encode(OP_LOAD, 4, OpSize::Quad, true, 0, 0, 0x3000),
        sys(OP_HALT),
    ]));
    // After the load, so the image zeroing does not clear it.
    bus.write64(0x3000, 0xFFFF_FFFF_FFFF_FFFF);
    cpu.execute();
    assert_eq!(cpu.regs[1], 0xFF);
    assert_eq!(cpu.regs[2], 0xFFFF);
    assert_eq!(cpu.regs[3], 0xFFFF_FFFF);
    assert_eq!(cpu.regs[4], u64::MAX);
}

#[test]
fn test_store_to_mmio_window_goes_through_bus() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let bus = Arc::new(intuition_core::core::bus::MemoryBus::new());
    let seen = Arc::new(AtomicU32::new(0));
    let s = seen.clone();
    bus.map_io(
        0xB0000,
        0xB00FF,
        Box::new(|_| 0),
        Box::new(move |_, val| s.store(val, Ordering::SeqCst)),
    );
    bus.seal_mappings();

    let mut cpu = Ie64::new(bus);
    cpu.load_program(&prog(&[
        ri(OP_MOVE, OpSize::Long, 1, 0, 0x600D_BEEF),
        encode(OP_STORE, 1, OpSize::Long, true, 0, 0, 0xB0000),
        sys(OP_HALT),
    ]));
    cpu.execute();
    assert_eq!(seen.load(Ordering::SeqCst), 0x600D_BEEF);
}

#[test]
fn test_negative_displacement() {
    let cpu = run_program(&[
        ri(OP_MOVE, OpSize::Quad, 1, 0, 0x2010),
        ri(OP_MOVE, OpSize::Quad, 2, 0, 0x77),
        encode(OP_STORE, 2, OpSize::Quad, true, 1, 0, 0xFFFF_FFF0), // (R1 - 0x10)
        encode(OP_LOAD, 3, OpSize::Quad, true, 0, 0, 0x2000),
        sys(OP_HALT),
    ]);
    assert_eq!(cpu.regs[3], 0x77);
}

// =============================================================================
// VRAM-direct window
// =============================================================================

#[test]
fn test_vram_window_intercepts_access() {
    let mut plane = vec![0u8; 0x1000];
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    unsafe {
        cpu.set_vram_window(plane.as_mut_ptr(), 0x0020_0000, 0x0020_1000);
    }
    cpu.load_program(&prog(&[
        ri(OP_MOVE, OpSize::Long, 1, 0, 0xAB12_CD34),
        encode(OP_STORE, 1, OpSize::Long, true, 0, 0, 0x0020_0010),
        encode(OP_LOAD, 2, OpSize::Long, true, 0, 0, 0x0020_0010),
        sys(OP_HALT),
    ]));
    cpu.execute();
    assert_eq!(cpu.regs[2], 0xAB12_CD34);
    // The window, not bus RAM, holds the data.
    assert_eq!(u32::from_le_bytes(plane[0x10..0x14].try_into().unwrap()), 0xAB12_CD34);
    assert_eq!(bus.read32(0x0020_0010), 0);
}

#[test]
fn test_same_program_without_window_uses_ram() {
    let bus = ram_bus();
    let mut cpu = Ie64::new(bus.clone());
    cpu.load_program(&prog(&[
        ri(OP_MOVE, OpSize::Long, 1, 0, 0xAB12_CD34),
        encode(OP_STORE, 1, OpSize::Long, true, 0, 0, 0x0020_0010),
        sys(OP_HALT),
    ]));
    cpu.execute();
    assert_eq!(bus.read32(0x0020_0010), 0xAB12_CD34);
}

// =============================================================================
// Fetch bounds
// =============================================================================

#[test]
fn test_execute_requires_pc_in_program_region() {
    let mut cpu = Ie64::new(ram_bus());
    cpu.load_program(&prog(&[sys(OP_HALT)]));
    cpu.pc = 0x500; // inside the vector table
    cpu.execute();
    assert!(!cpu.shared().running.load(std::sync::atomic::Ordering::Acquire));
}

#[test]
fn test_rr_forms_ignore_immediate() {
    let cpu = run_program(&[
        ri(OP_MOVE, OpSize::Quad, 1, 0, 10),
        ri(OP_MOVE, OpSize::Quad, 2, 0, 20),
        rr(OP_ADD, OpSize::Quad, 3, 1, 2),
        sys(OP_HALT),
    ]);
    assert_eq!(cpu.regs[3], 30);
}
