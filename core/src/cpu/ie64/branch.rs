use super::Ie64;
use super::opcodes::*;

impl Ie64 {
    /// Compare-and-branch group. The comparison is always `Rs` against
    /// `Rt` at the operation size; `imm32` is the signed PC-relative
    /// displacement, so the X bit has no meaning here.
    pub(crate) fn op_branch(&mut self, i: &Instruction) {
        let size = i.size;
        let a = self.regs[i.rs];
        let b = self.regs[i.rt];

        let taken = match i.opcode {
            OP_BRA => true,
            OP_BEQ => size.mask(a) == size.mask(b),
            OP_BNE => size.mask(a) != size.mask(b),
            OP_BLT => size.sign_extend(a) < size.sign_extend(b),
            OP_BGE => size.sign_extend(a) >= size.sign_extend(b),
            OP_BGT => size.sign_extend(a) > size.sign_extend(b),
            OP_BLE => size.sign_extend(a) <= size.sign_extend(b),
            OP_BHI => size.mask(a) > size.mask(b),
            OP_BLS => size.mask(a) <= size.mask(b),
            _ => unreachable!("non-branch opcode routed to op_branch"),
        };

        if taken {
            self.pc = self.pc.wrapping_add(i.disp() as u64);
        } else {
            self.pc += 8;
        }
    }

    /// JSR (PC-relative) and JSR_IND (via operand3): push the return
    /// address, then transfer. Returns false on a stack fault.
    pub(crate) fn op_jsr(&mut self, i: &Instruction) -> bool {
        let ret = self.pc + 8;
        if !self.push64(ret) {
            return false;
        }
        self.pc = match i.opcode {
            OP_JSR => self.pc.wrapping_add(i.disp() as u64),
            _ => self.operand3(i),
        };
        true
    }

    pub(crate) fn op_rts(&mut self) -> bool {
        match self.pop64() {
            Some(ret) => {
                self.pc = ret;
                true
            }
            None => false,
        }
    }

    /// Return from interrupt: pop the interrupted PC and unmask.
    pub(crate) fn op_rti(&mut self) -> bool {
        match self.pop64() {
            Some(ret) => {
                self.pc = ret;
                self.shared
                    .irq_in_handler
                    .store(false, std::sync::atomic::Ordering::Release);
                true
            }
            None => false,
        }
    }
}
