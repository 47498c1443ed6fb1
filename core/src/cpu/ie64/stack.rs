use std::sync::atomic::Ordering;

use log::error;

use super::Ie64;
use super::opcodes::*;
use crate::core::bus::MEM_SIZE;

impl Ie64 {
    /// PUSH / POP move `Rd` through the stack. Returns false on a stack
    /// fault (the CPU is halted).
    pub(crate) fn op_stack(&mut self, i: &Instruction) -> bool {
        match i.opcode {
            OP_PUSH => {
                let val = self.regs[i.rd];
                if !self.push64(val) {
                    return false;
                }
            }
            OP_POP => match self.pop64() {
                Some(val) => self.set_reg(i.rd, val),
                None => return false,
            },
            _ => unreachable!("non-stack opcode routed to op_stack"),
        }
        self.pc += 8;
        true
    }

    /// Push one 64-bit word. The stack grows down from R31; running off
    /// either end of the address space is a fatal guest fault.
    pub(crate) fn push64(&mut self, val: u64) -> bool {
        let old = self.regs[31];
        let sp = old.wrapping_sub(8);
        if sp > old || sp as usize + 8 > MEM_SIZE {
            error!("IE64: stack overflow at SP {old:#010X}");
            self.shared.running.store(false, Ordering::Release);
            return false;
        }
        self.regs[31] = sp;
        self.store_mem(sp, val, OpSize::Quad);
        true
    }

    /// Pop one 64-bit word.
    pub(crate) fn pop64(&mut self) -> Option<u64> {
        let sp = self.regs[31];
        if sp as usize + 8 > MEM_SIZE {
            error!("IE64: stack underflow at SP {sp:#010X}");
            self.shared.running.store(false, Ordering::Release);
            return None;
        }
        let val = self.load_mem(sp, OpSize::Quad);
        self.regs[31] = sp + 8;
        Some(val)
    }
}
