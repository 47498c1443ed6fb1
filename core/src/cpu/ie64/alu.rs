use super::Ie64;
use super::opcodes::*;

impl Ie64 {
    /// Arithmetic, logic, and shift group. Binary forms compute
    /// `Rd = op(Rs, operand3)`; unary NEG/NOT operate on `Rs`. Results
    /// are truncated to the operation width and zero-extended.
    pub(crate) fn op_alu(&mut self, i: &Instruction) {
        let size = i.size;
        let a = self.regs[i.rs];
        let b = self.operand3(i);

        let result = match i.opcode {
            OP_ADD => a.wrapping_add(b),
            OP_SUB => a.wrapping_sub(b),
            OP_MULU => size.mask(a).wrapping_mul(size.mask(b)),
            OP_MULS => (size.sign_extend(a).wrapping_mul(size.sign_extend(b))) as u64,
            OP_DIVU => {
                let d = size.mask(b);
                // Division by zero writes zero, no trap.
                if d == 0 { 0 } else { size.mask(a) / d }
            }
            OP_DIVS => {
                let d = size.sign_extend(b);
                if d == 0 {
                    0
                } else {
                    size.sign_extend(a).wrapping_div(d) as u64
                }
            }
            OP_MOD => {
                let d = size.mask(b);
                if d == 0 { 0 } else { size.mask(a) % d }
            }
            OP_NEG => 0u64.wrapping_sub(a),
            OP_AND => a & b,
            OP_OR => a | b,
            OP_EOR => a ^ b,
            OP_NOT => !a,
            OP_LSL => {
                let sh = (b & 63) as u32;
                size.mask(a) << sh
            }
            OP_LSR => {
                let sh = (b & 63) as u32;
                size.mask(a) >> sh
            }
            OP_ASR => {
                // Sign-extend from the operation width before shifting.
                let sh = (b & 63) as u32;
                (size.sign_extend(a) >> sh) as u64
            }
            _ => unreachable!("non-ALU opcode routed to op_alu"),
        };

        self.set_reg(i.rd, size.mask(result));
    }
}
