#![allow(dead_code)]

use std::sync::Arc;

use intuition_core::core::bus::MemoryBus;
use intuition_core::cpu::Ie64;
use intuition_core::cpu::ie64::opcodes::{OpSize, encode};

/// Fresh sealed bus with no MMIO mappings: plain 32 MiB of RAM.
pub fn ram_bus() -> Arc<MemoryBus> {
    let bus = Arc::new(MemoryBus::new());
    bus.seal_mappings();
    bus
}

/// Register/register instruction form (X clear).
pub fn rr(op: u8, size: OpSize, rd: u8, rs: u8, rt: u8) -> [u8; 8] {
    encode(op, rd, size, false, rs, rt, 0)
}

/// Register/immediate instruction form (X set).
pub fn ri(op: u8, size: OpSize, rd: u8, rs: u8, imm: u32) -> [u8; 8] {
    encode(op, rd, size, true, rs, 0, imm)
}

/// Compare-and-branch form: `Rs` against `Rt`, signed displacement.
pub fn branch(op: u8, rs: u8, rt: u8, disp: i32) -> [u8; 8] {
    encode(op, 0, OpSize::Quad, false, rs, rt, disp as u32)
}

/// Operand-less system instruction (NOP, HALT, SEI, CLI, RTS, RTI).
pub fn sys(op: u8) -> [u8; 8] {
    encode(op, 0, OpSize::Quad, false, 0, 0, 0)
}

/// Flatten instruction words into a program image.
pub fn prog(words: &[[u8; 8]]) -> Vec<u8> {
    words.concat()
}

/// Load a program onto a fresh RAM-only system and run it to halt.
pub fn run_program(words: &[[u8; 8]]) -> Ie64 {
    let mut cpu = Ie64::new(ram_bus());
    cpu.load_program(&prog(words));
    cpu.execute();
    cpu
}
