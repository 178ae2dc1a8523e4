use super::fpu;
use super::{Core, CsrSpecifier, Exception, ExecutionResult, ExtensionContextStatus};
use crate::bus::BusError;
use crate::instruction::{CsrOp, FenceOrderCombination, FpFusedOp, FpOp};
use crate::registers::{Registers, Specifier};
use crate::system_bus::SystemBus;
use crate::{DataSize, PrivilegeLevel};
use rustc_apfloat::Round;

#[derive(Debug)]
pub(super) struct Executor<'c, 'b> {
    pub core: &'c mut Core,
    pub bus: &'b mut SystemBus,
}

impl<'c, 'b> Executor<'c, 'b> {
    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1. Arithmetic overflow is
    /// > ignored and the result is simply the low XLEN bits of the result. ADDI rd, rs1, 0 is
    /// > used to implement the MV rd, rs1 assembler pseudoinstruction.
    pub fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| {
            s.wrapping_add_signed(imm as i64)
        })
    }

    /// > SLTI (set less than immediate) places the value 1 in register rd if register rs1 is less
    /// > than the sign-extended immediate when both are treated as signed numbers, else 0 is
    /// > written to rd.
    pub fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| {
            ((s as i64) < imm as i64) as u64
        })
    }

    /// > SLTIU is similar but compares the values as unsigned numbers (i.e., the immediate is
    /// > first sign-extended to XLEN bits then treated as an unsigned number).
    pub fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| {
            (s < imm as i64 as u64) as u64
        })
    }

    pub fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s & imm as i64 as u64)
    }

    pub fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s | imm as i64 as u64)
    }

    pub fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ imm as i64 as u64)
    }

    /// Executes a `slli` instruction. The shift amount is a 6-bit value on RV64.
    pub fn slli(&mut self, dest: Specifier, src: Specifier, shift_amount_u6: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| s << shamt)
    }

    pub fn srli(&mut self, dest: Specifier, src: Specifier, shift_amount_u6: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| s >> shamt)
    }

    pub fn srai(&mut self, dest: Specifier, src: Specifier, shift_amount_u6: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u6, |s, shamt| {
            ((s as i64) >> shamt) as u64
        })
    }

    /// > ADDIW is an RV64I instruction that adds the sign-extended 12-bit immediate to register
    /// > rs1 and produces the proper sign-extension of a 32-bit result in rd. Overflows are
    /// > ignored and the result is the low 32 bits of the result sign-extended to 64 bits.
    pub fn addiw(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| {
            (s as i32).wrapping_add(imm) as u64
        })
    }

    /// > SLLIW, SRLIW, and SRAIW are RV64I-only instructions that are analogously defined but
    /// > operate on 32-bit values and sign-extend their 32-bit results to 64 bits.
    pub fn slliw(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as u32) << shamt) as i32 as u64
        })
    }

    pub fn srliw(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as u32) >> shamt) as i32 as u64
        })
    }

    pub fn sraiw(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as i32) >> shamt) as u64
        })
    }

    /// > LUI (load upper immediate) is used to build 32-bit constants and uses the U-type format.
    /// > LUI places the 32-bit U-immediate value into the destination register rd, filling in the
    /// > lowest 12 bits with zeros. The 32-bit result is sign-extended to 64 bits.
    pub fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let result = (immediate & !0xFFF) as i64 as u64;
        let registers = self.core.registers_mut();
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    /// > AUIPC (add upper immediate to pc) is used to build pc-relative addresses and uses the
    /// > U-type format. AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling in the
    /// > lowest 12 bits with zeros, sign-extends the result to 64 bits, adds it to the address of
    /// > the AUIPC instruction, then places the result in register rd.
    pub fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let registers = self.core.registers_mut();
        let result = registers
            .pc()
            .wrapping_add_signed((immediate & !0xFFF) as i64);
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    pub fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    pub fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    pub fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64) < (s2 as i64)) as u64
        })
    }

    pub fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u64)
    }

    pub fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    pub fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    pub fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// > SLL, SRL, and SRA perform logical left, logical right, and arithmetic right shifts on
    /// > the value in register rs1 by the shift amount held in the lower 6 bits of register rs2.
    pub fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x3F))
    }

    pub fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x3F))
    }

    pub fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64) >> (s2 & 0x3F)) as u64
        })
    }

    pub fn addw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (s1 as i32).wrapping_add(s2 as i32) as u64
        })
    }

    pub fn subw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (s1 as i32).wrapping_sub(s2 as i32) as u64
        })
    }

    /// > SLLW, SRLW, and SRAW are RV64I-only instructions [...]. The shift amount is given by
    /// > rs2\[4:0].
    pub fn sllw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u32) << (s2 & 0x1F)) as i32 as u64
        })
    }

    pub fn srlw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u32) >> (s2 & 0x1F)) as i32 as u64
        })
    }

    pub fn sraw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u64
        })
    }

    /// > MUL performs an XLEN-bit × XLEN-bit multiplication of rs1 by rs2 and places the lower
    /// > XLEN bits in the destination register.
    pub fn mul(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    /// > MULH, MULHU, and MULHSU perform the same multiplication but return the upper XLEN bits
    /// > of the full 2×XLEN-bit product, for signed×signed, unsigned×unsigned, and
    /// > signed rs1 × unsigned rs2 multiplication, respectively.
    pub fn mulh(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64 as i128 * s2 as i64 as i128) >> 64) as u64
        })
    }

    pub fn mulhsu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i64 as i128 * s2 as u128 as i128) >> 64) as u64
        })
    }

    pub fn mulhu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u128 * s2 as u128) >> 64) as u64
        })
    }

    /// > DIV and DIVU perform an XLEN bits by XLEN bits signed and unsigned integer division of
    /// > rs1 by rs2, rounding towards zero.
    ///
    /// > The quotient of division by zero has all bits set. [...] Signed division overflow occurs
    /// > only when the most-negative integer is divided by −1; the quotient is equal to the
    /// > dividend.
    pub fn div(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i64, s2 as i64);
            if s2 == 0 {
                u64::MAX
            } else if s1 == i64::MIN && s2 == -1 {
                s1 as u64
            } else {
                s1.wrapping_div(s2) as u64
            }
        })
    }

    pub fn divu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            if s2 == 0 {
                u64::MAX
            } else {
                s1 / s2
            }
        })
    }

    /// > REM and REMU provide the remainder of the corresponding division operation. For REM, the
    /// > sign of a nonzero result equals the sign of the dividend.
    ///
    /// > The remainder of division by zero equals the dividend. [...] For signed division
    /// > overflow the remainder is zero.
    pub fn rem(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i64, s2 as i64);
            if s2 == 0 {
                s1 as u64
            } else if s1 == i64::MIN && s2 == -1 {
                0
            } else {
                s1.wrapping_rem(s2) as u64
            }
        })
    }

    pub fn remu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            if s2 == 0 {
                s1
            } else {
                s1 % s2
            }
        })
    }

    /// > MULW is an RV64 instruction that multiplies the lower 32 bits of the source registers,
    /// > placing the sign-extension of the lower 32 bits of the result into the destination.
    pub fn mulw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            (s1 as i32).wrapping_mul(s2 as i32) as u64
        })
    }

    pub fn divw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i32, s2 as i32);
            if s2 == 0 {
                u64::MAX
            } else if s1 == i32::MIN && s2 == -1 {
                s1 as u64
            } else {
                s1.wrapping_div(s2) as u64
            }
        })
    }

    pub fn divuw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as u32, s2 as u32);
            if s2 == 0 {
                u64::MAX
            } else {
                (s1 / s2) as i32 as u64
            }
        })
    }

    pub fn remw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as i32, s2 as i32);
            if s2 == 0 {
                s1 as u64
            } else if s1 == i32::MIN && s2 == -1 {
                0
            } else {
                s1.wrapping_rem(s2) as u64
            }
        })
    }

    pub fn remuw(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            let (s1, s2) = (s1 as u32, s2 as u32);
            if s2 == 0 {
                s1 as i32 as u64
            } else {
                (s1 % s2) as i32 as u64
            }
        })
    }

    pub fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.pc().wrapping_add_signed(offset as i64)
        })
    }

    pub fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.x(base).wrapping_add_signed(offset as i64) & !1
        })
    }

    pub fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    pub fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    pub fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i64) < (s2 as i64))
    }

    pub fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    pub fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i64) >= (s2 as i64))
    }

    pub fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    pub fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Byte, |value| {
            value as u8 as i8 as u64
        })
    }

    pub fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Byte, |value| value)
    }

    pub fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Halfword, |value| {
            value as u16 as i16 as u64
        })
    }

    pub fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Halfword, |value| value)
    }

    pub fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Word, |value| {
            value as u32 as i32 as u64
        })
    }

    pub fn lwu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Word, |value| value)
    }

    pub fn ld(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, DataSize::Doubleword, |value| value)
    }

    pub fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, DataSize::Byte)
    }

    pub fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, DataSize::Halfword)
    }

    pub fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, DataSize::Word)
    }

    pub fn sd(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, DataSize::Doubleword)
    }

    pub fn fence(
        &mut self,
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    ) -> ExecutionResult {
        // Since only one hart is supported and device accesses complete synchronously, this is
        // equivalent to a nop instruction.
        let _ = predecessor;
        let _ = successor;
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    /// > The ECALL instruction is used to make a service request to the execution environment.
    ///
    /// mepc is left pointing at the ECALL itself; the handler is responsible for advancing it.
    pub fn ecall(&mut self) -> ExecutionResult {
        Err(match self.core.privilege_mode() {
            PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
        })
    }

    pub fn ebreak(&mut self) -> ExecutionResult {
        Err(Exception::Breakpoint)
    }

    pub fn mret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode() != PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction);
        }
        self.core.return_from_m_trap();
        Ok(())
    }

    pub fn sret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode() < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction);
        }
        self.core.return_from_s_trap();
        Ok(())
    }

    /// > The Wait for Interrupt instruction (WFI) provides a hint to the implementation that the
    /// > current hart can be stalled [...]. An implementation may implement WFI as a nop.
    pub fn wfi(&mut self) -> ExecutionResult {
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    //
    // Zicsr
    //

    /// > The CSRRW (Atomic Read/Write CSR) instruction atomically swaps values in the CSRs and
    /// > integer registers. CSRRW reads the old value of the CSR, zero-extends the value to XLEN
    /// > bits, then writes it to integer register rd. The initial value in rs1 is written to the
    /// > CSR. If rd=x0, then the instruction shall not read the CSR and shall not cause any of
    /// > the side effects that might occur on a CSR read.
    pub fn csrrw(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadWrite, dest, csr, src)
    }

    /// > The CSRRS (Atomic Read and Set Bits in CSR) instruction reads the value of the CSR,
    /// > zero-extends the value to XLEN bits, and writes it to integer register rd. The initial
    /// > value in integer register rs1 is treated as a bit mask that specifies bit positions to
    /// > be set in the CSR. [...]
    ///
    /// > For both CSRRS and CSRRC, if rs1=x0, then the instruction will not write to the CSR at
    /// > all, and so shall not cause any of the side effects that might otherwise occur on a CSR
    /// > write.
    pub fn csrrs(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadSet, dest, csr, src)
    }

    pub fn csrrc(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        self.csr_reg_op(CsrOp::ReadClear, dest, csr, src)
    }

    /// > The CSRRWI, CSRRSI, and CSRRCI variants are similar to CSRRW, CSRRS, and CSRRC
    /// > respectively, except they update the CSR using an XLEN-bit value obtained by
    /// > zero-extending a 5-bit unsigned immediate (uimm\[4:0]) field encoded in the rs1 field
    /// > instead of a value from an integer register. For CSRRSI and CSRRCI, if the uimm\[4:0]
    /// > field is zero, then these instructions will not write to the CSR.
    pub fn csrrwi(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadWrite, dest, csr, immediate)
    }

    pub fn csrrsi(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadSet, dest, csr, immediate)
    }

    pub fn csrrci(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        self.csr_imm_op(CsrOp::ReadClear, dest, csr, immediate)
    }

    //
    // F standard extension
    //

    pub fn flw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.check_fpu_on()?;
        let address = self
            .core
            .registers()
            .x(base)
            .wrapping_add_signed(offset as i64);
        let value = self.read_memory(address, DataSize::Word)?;
        self.core.fregisters.set_f32_bits(dest, value as u32);
        self.set_fpu_dirty();
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    /// FSW moves the low 32 bits of the register to memory without caring about NaN boxing.
    pub fn fsw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.check_fpu_on()?;
        let address = self
            .core
            .registers()
            .x(base)
            .wrapping_add_signed(offset as i64);
        let value = self.core.fregisters.f(src) as u32;
        self.write_memory(address, DataSize::Word, value as u64)?;
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    pub fn op_fp(
        &mut self,
        op: FpOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        rm: u8,
    ) -> ExecutionResult {
        self.check_fpu_on()?;
        let a = self.core.fregisters.f32_bits(src1);
        let b = self.core.fregisters.f32_bits(src2);
        match op {
            FpOp::Fadd => self.fp_arith(dest, rm, |round| fpu::add(a, b, round)),
            FpOp::Fsub => self.fp_arith(dest, rm, |round| fpu::sub(a, b, round)),
            FpOp::Fmul => self.fp_arith(dest, rm, |round| fpu::mul(a, b, round)),
            FpOp::Fdiv => self.fp_arith(dest, rm, |round| fpu::div(a, b, round)),
            FpOp::Fsqrt => self.fp_arith(dest, rm, |round| fpu::sqrt(a, round)),
            FpOp::Fsgnj => self.fp_write(dest, fpu::sign_inject(a, b)),
            FpOp::Fsgnjn => self.fp_write(dest, fpu::sign_inject_neg(a, b)),
            FpOp::Fsgnjx => self.fp_write(dest, fpu::sign_inject_xor(a, b)),
            FpOp::Fmin => {
                let (value, status) = fpu::min(a, b);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::Fmax => {
                let (value, status) = fpu::max(a, b);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::FcvtWS => {
                let round = self.rounding_mode(rm)?;
                let (value, status) = fpu::to_signed(a, 32, round);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value as u64)
            }
            FpOp::FcvtWuS => {
                let round = self.rounding_mode(rm)?;
                let (value, status) = fpu::to_unsigned(a, 32, round);
                self.core.fcsr.accrue(status);
                // The 32-bit result is sign-extended, as for all W-form results.
                self.x_write(dest, value as u32 as i32 as u64)
            }
            FpOp::FcvtLS => {
                let round = self.rounding_mode(rm)?;
                let (value, status) = fpu::to_signed(a, 64, round);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value as u64)
            }
            FpOp::FcvtLuS => {
                let round = self.rounding_mode(rm)?;
                let (value, status) = fpu::to_unsigned(a, 64, round);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value)
            }
            FpOp::FcvtSW => {
                let round = self.rounding_mode(rm)?;
                let int = self.core.registers().x(src1) as i32;
                let (value, status) = fpu::from_signed(int as i64, round);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::FcvtSWu => {
                let round = self.rounding_mode(rm)?;
                let int = self.core.registers().x(src1) as u32;
                let (value, status) = fpu::from_unsigned(int as u64, round);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::FcvtSL => {
                let round = self.rounding_mode(rm)?;
                let int = self.core.registers().x(src1) as i64;
                let (value, status) = fpu::from_signed(int, round);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::FcvtSLu => {
                let round = self.rounding_mode(rm)?;
                let int = self.core.registers().x(src1);
                let (value, status) = fpu::from_unsigned(int, round);
                self.core.fcsr.accrue(status);
                self.fp_write(dest, value)
            }
            FpOp::FmvXW => {
                // fmv.x.w moves the raw bit pattern, sign-extending bit 31; no unboxing.
                let raw = self.core.fregisters.f(src1) as u32;
                self.x_write(dest, raw as i32 as u64)
            }
            FpOp::FmvWX => {
                let raw = self.core.registers().x(src1) as u32;
                self.fp_write(dest, raw)
            }
            FpOp::Feq => {
                let (value, status) = fpu::eq(a, b);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value as u64)
            }
            FpOp::Flt => {
                let (value, status) = fpu::lt(a, b);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value as u64)
            }
            FpOp::Fle => {
                let (value, status) = fpu::le(a, b);
                self.core.fcsr.accrue(status);
                self.x_write(dest, value as u64)
            }
            FpOp::Fclass => {
                let value = fpu::classify(a);
                self.x_write(dest, value)
            }
        }
    }

    pub fn fp_fused(
        &mut self,
        op: FpFusedOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
        rm: u8,
    ) -> ExecutionResult {
        self.check_fpu_on()?;
        let a = self.core.fregisters.f32_bits(src1);
        let b = self.core.fregisters.f32_bits(src2);
        let c = self.core.fregisters.f32_bits(src3);
        let op = match op {
            FpFusedOp::Fmadd => fpu::mul_add,
            FpFusedOp::Fmsub => fpu::mul_sub,
            FpFusedOp::Fnmsub => fpu::neg_mul_add,
            FpFusedOp::Fnmadd => fpu::neg_mul_sub,
        };
        self.fp_arith(dest, rm, |round| op(a, b, c, round))
    }

    // Private generic implementations

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, i32) -> u64,
    {
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src), immediate));
        increment_pc(registers);
        Ok(())
    }

    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, u32) -> u64,
    {
        if shift_amount > 63 {
            panic!("out of range shift amount used");
        }
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src), shift_amount));
        increment_pc(registers);
        Ok(())
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64, u64) -> u64,
    {
        let registers = self.core.registers_mut();
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        increment_pc(registers);
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&Registers) -> u64,
    {
        let registers = self.core.registers_mut();
        // Compute target pc
        let new_pc = compute_target(registers);
        // Check target pc is word-aligned
        if !DataSize::Word.is_aligned(new_pc) {
            return Err(Exception::InstructionAddressMisaligned(new_pc));
        }
        // Update pc to target
        let old_pc = std::mem::replace(registers.pc_mut(), new_pc);
        // Write incremented old pc to `dest` register
        registers.set_x(dest, old_pc.wrapping_add(4));
        Ok(())
    }

    // Takes the branch if `predicate` returns `true`.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u64, u64) -> bool,
    {
        let registers = self.core.registers_mut();
        if predicate(registers.x(src1), registers.x(src2)) {
            let new_pc = registers.pc().wrapping_add_signed(offset as i64);
            // Check target pc is word-aligned
            if !DataSize::Word.is_aligned(new_pc) {
                return Err(Exception::InstructionAddressMisaligned(new_pc));
            }
            *registers.pc_mut() = new_pc;
        } else {
            increment_pc(registers);
        }
        Ok(())
    }

    fn load_op<F>(
        &mut self,
        dest: Specifier,
        base: Specifier,
        offset: i32,
        size: DataSize,
        extend: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u64) -> u64,
    {
        let address = self
            .core
            .registers()
            .x(base)
            .wrapping_add_signed(offset as i64);
        let value = self.read_memory(address, size)?;
        let registers = self.core.registers_mut();
        registers.set_x(dest, extend(value));
        increment_pc(registers);
        Ok(())
    }

    fn store_op(
        &mut self,
        src: Specifier,
        base: Specifier,
        offset: i32,
        size: DataSize,
    ) -> ExecutionResult {
        let registers = self.core.registers();
        let value = registers.x(src) & size.mask();
        let address = registers.x(base).wrapping_add_signed(offset as i64);
        self.write_memory(address, size, value)?;
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    fn read_memory(&mut self, address: u64, size: DataSize) -> Result<u64, Exception> {
        self.bus.read(address, size).map_err(|err| match err {
            BusError::Misaligned { .. } => Exception::LoadAddressMisaligned(address),
            BusError::Unmapped(_) => Exception::LoadAccessFault(address),
        })
    }

    fn write_memory(&mut self, address: u64, size: DataSize, value: u64) -> Result<(), Exception> {
        self.bus
            .write(address, size, value)
            .map_err(|err| match err {
                BusError::Misaligned { .. } => Exception::StoreAddressMisaligned(address),
                BusError::Unmapped(_) => Exception::StoreAccessFault(address),
            })
    }

    fn csr_reg_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || src != Specifier::X0)
                .then(|| self.core.registers().x(src)),
        )
    }

    fn csr_imm_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate as u64),
        )
    }

    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src_value: Option<u64>,
    ) -> ExecutionResult {
        // Read and store the core's current privilege level, since the CSR write may cause the
        // privilege level to be changed as a side-effect. This CSR operation should be atomic, so
        // both the read and write should be performed at the same, original privilege level.
        let privilege_level = self.core.privilege_mode();
        if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            let old_value = self
                .core
                .read_csr(self.bus, csr, privilege_level)
                .map_err(|_| Exception::IllegalInstruction)?;
            self.core.registers_mut().set_x(dest, old_value);
        };
        if let Some(src_value) = src_value {
            let (value, mask) = match op {
                CsrOp::ReadWrite => (src_value, u64::MAX),
                CsrOp::ReadSet => (u64::MAX, src_value),
                CsrOp::ReadClear => (0, src_value),
            };
            self.core
                .write_csr(csr, privilege_level, value, mask)
                .map_err(|_| Exception::IllegalInstruction)?;
        }
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    fn check_fpu_on(&self) -> Result<(), Exception> {
        if self.core.status.fs() == ExtensionContextStatus::Off {
            return Err(Exception::IllegalInstruction);
        }
        Ok(())
    }

    fn set_fpu_dirty(&mut self) {
        self.core.status.set_fs(ExtensionContextStatus::Dirty);
    }

    fn rounding_mode(&self, rm: u8) -> Result<Round, Exception> {
        fpu::resolve_rounding_mode(rm, &self.core.fcsr).ok_or(Exception::IllegalInstruction)
    }

    /// Common tail of the rounding FP operations: resolve the rounding mode, run the operation,
    /// accrue its flags, and retire into an f register.
    fn fp_arith<F>(&mut self, dest: Specifier, rm: u8, op: F) -> ExecutionResult
    where
        F: FnOnce(Round) -> (u32, rustc_apfloat::Status),
    {
        let round = self.rounding_mode(rm)?;
        let (value, status) = op(round);
        self.core.fcsr.accrue(status);
        self.fp_write(dest, value)
    }

    /// Retire a single-precision result into an f register.
    fn fp_write(&mut self, dest: Specifier, value: u32) -> ExecutionResult {
        self.core.fregisters.set_f32_bits(dest, value);
        self.set_fpu_dirty();
        increment_pc(self.core.registers_mut());
        Ok(())
    }

    /// Retire a result of an FP instruction into an x register.
    fn x_write(&mut self, dest: Specifier, value: u64) -> ExecutionResult {
        let registers = self.core.registers_mut();
        registers.set_x(dest, value);
        increment_pc(registers);
        Ok(())
    }
}


fn increment_pc(registers: &mut Registers) {
    let pc = registers.pc_mut();
    *pc = pc.wrapping_add(4);
}
