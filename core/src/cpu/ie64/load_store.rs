use std::ptr;

use super::Ie64;
use super::opcodes::*;
use crate::core::bus::{IO_REGION_START, MEM_SIZE};

impl Ie64 {
    /// MOVE / MOVT / MOVEQ / LEA.
    pub(crate) fn op_move_group(&mut self, i: &Instruction) {
        match i.opcode {
            OP_MOVE => {
                let val = i.size.mask(self.operand3(i));
                self.set_reg(i.rd, val);
            }
            OP_MOVT => {
                // Replace the upper 32 bits, keeping the lower half.
                let val = (self.regs[i.rd] & 0xFFFF_FFFF) | ((i.imm as u64) << 32);
                self.set_reg(i.rd, val);
            }
            OP_MOVEQ => self.set_reg(i.rd, i.imm as i32 as i64 as u64),
            OP_LEA => {
                let val = self.regs[i.rs].wrapping_add(i.disp() as u64);
                self.set_reg(i.rd, val);
            }
            _ => unreachable!("non-move opcode routed to op_move_group"),
        }
    }

    /// LOAD / STORE with `(Rs + disp)` addressing.
    pub(crate) fn op_mem_group(&mut self, i: &Instruction) {
        let addr = self.regs[i.rs].wrapping_add(i.disp() as u64);
        match i.opcode {
            OP_LOAD => {
                let val = self.load_mem(addr, i.size);
                self.set_reg(i.rd, val);
            }
            OP_STORE => self.store_mem(addr, self.regs[i.rd], i.size),
            _ => unreachable!("non-memory opcode routed to op_mem_group"),
        }
    }

    /// Data load: VRAM window first, then the cached RAM plane for
    /// everything below the MMIO window, then full bus dispatch.
    pub(crate) fn load_mem(&self, addr: u64, size: OpSize) -> u64 {
        let a = addr as u32;
        if let Some(w) = &self.vram_window
            && a >= w.start
            && a.wrapping_add(size.bytes()) <= w.end
        {
            let p = unsafe { w.base.add((a - w.start) as usize) };
            return unsafe { Self::read_native(p, size) };
        }
        if addr < IO_REGION_START as u64 {
            let p = unsafe { self.ram.add(a as usize) };
            return unsafe { Self::read_native(p, size) };
        }
        match size {
            OpSize::Byte => self.bus.read8(a) as u64,
            OpSize::Word => self.bus.read16(a) as u64,
            OpSize::Long => self.bus.read32(a) as u64,
            OpSize::Quad => self.bus.read64(a),
        }
    }

    /// Data store, same routing as [`load_mem`](Self::load_mem).
    pub(crate) fn store_mem(&mut self, addr: u64, val: u64, size: OpSize) {
        let a = addr as u32;
        if let Some(w) = &self.vram_window
            && a >= w.start
            && a.wrapping_add(size.bytes()) <= w.end
        {
            let p = unsafe { w.base.add((a - w.start) as usize) };
            unsafe { Self::write_native(p, val, size) };
            return;
        }
        if addr < IO_REGION_START as u64 {
            let p = unsafe { self.ram.add(a as usize) };
            unsafe { Self::write_native(p, val, size) };
            return;
        }
        match size {
            OpSize::Byte => self.bus.write8(a, val as u8),
            OpSize::Word => self.bus.write16(a, val as u16),
            OpSize::Long => self.bus.write32(a, val as u32),
            OpSize::Quad => self.bus.write64(a, val),
        }
    }

    #[inline]
    unsafe fn read_native(p: *const u8, size: OpSize) -> u64 {
        unsafe {
            match size {
                OpSize::Byte => *p as u64,
                OpSize::Word => u16::from_le(ptr::read_unaligned(p as *const u16)) as u64,
                OpSize::Long => u32::from_le(ptr::read_unaligned(p as *const u32)) as u64,
                OpSize::Quad => u64::from_le(ptr::read_unaligned(p as *const u64)),
            }
        }
    }

    #[inline]
    unsafe fn write_native(p: *mut u8, val: u64, size: OpSize) {
        unsafe {
            match size {
                OpSize::Byte => *p = val as u8,
                OpSize::Word => ptr::write_unaligned(p as *mut u16, (val as u16).to_le()),
                OpSize::Long => ptr::write_unaligned(p as *mut u32, (val as u32).to_le()),
                OpSize::Quad => ptr::write_unaligned(p as *mut u64, val.to_le()),
            }
        }
    }
}

// The cached-RAM path never runs past the plane: IO_REGION_START plus the
// widest access is far below MEM_SIZE.
const _: () = assert!(IO_REGION_START as usize + 8 < MEM_SIZE);
