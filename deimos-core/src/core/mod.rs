//! Provides a simulatable RV64IMF core implementation.

mod control;
mod counters;
pub mod csr;
mod execute;
pub mod fpu;
mod interrupts;
mod status;
mod trap;

use crate::instruction::{
    BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegReg32Op, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::registers::{FRegisters, Registers};
use crate::system_bus::SystemBus;
use crate::{DataSize, PrivilegeLevel};
use execute::Executor;
use log::trace;
use thiserror::Error;

pub use counters::Counters;
pub use csr::CsrSpecifier;
pub use fpu::Fcsr;
pub use interrupts::Interrupts;
pub use status::{ExtensionContextStatus, Status};

#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. This register must be readable in any implementation.
    /// > Hart IDs might not necessarily be numbered contiguously in a multiprocessor system, but
    /// > at least one hart must have a hart ID of zero.
    pub hart_id: u64,
    /// Address to which the core's PC register is reset. For ELF guests this is the entry point.
    pub reset_vector: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hart_id: 0,
            reset_vector: 0x8000_0000,
        }
    }
}

/// RISC-V core implementing the RV64IMF_Zicsr ISA.
///
/// As we don't support hardware multithreading, every core always only has a single hart.
/// We therefore don't model RISC-V harts explicitly, but rather consider [`Core`] to be the whole
/// of a core with a single hart.
///
/// > From the perspective of software running in a given execution environment, a hart is a
/// > resource that autonomously fetches and executes RISC-V instructions within that execution
/// > environment.
///
/// # Control and Status Registers
///
/// This structure also contains the CSRs as per the Zicsr extension.
///
/// > RISC-V defines a separate address space of 4096 Control and Status registers associated with
/// > each hart.
///
/// > The standard RISC-V ISA sets aside a 12-bit encoding space (csr\[11:0]) for up to 4,096 CSRs.
/// > By convention, the upper 4 bits of the CSR address (csr\[11:8]) are used to encode the read
/// > and write accessibility of the CSRs according to privilege level as shown in Table 2.1. The
/// > top two bits (csr\[11:10]) indicate whether the register is read/write (00, 01, or 10) or
/// > read-only (11). The next two bits (csr\[9:8]) encode the lowest privilege level that can
/// > access the CSR.
#[derive(Debug)]
pub struct Core {
    config: Config,
    registers: Registers,
    fregisters: FRegisters,
    fcsr: Fcsr,
    status: Status,
    interrupts: Interrupts,
    trap: trap::Trap,
    control: control::Control,
    counters: Counters,
    privilege_mode: PrivilegeLevel,
    /// `(code, pc)` of the exception taken by the previous step, if that step trapped. Used to
    /// detect a hart that faults over and over without retiring anything in between.
    last_exception: Option<(u64, u64)>,
}

impl Core {
    /// The misa CSR indicates that MXL=64 and that extensions I, M, F, S, and U are supported.
    ///
    /// > The misa CSR is a WARL read-write register reporting the ISA supported by the hart.
    #[allow(clippy::identity_op)]
    pub const MISA: u64 = (2 << 62) // MXL=2 (XLEN 64)
        | (1 << 8)  // I
        | (1 << 12) // M
        | (1 << 5)  // F
        | (1 << 18) // S
        | (1 << 20); // U
    /// The mvendorid CSR is set to 0 to indicate this is a non-commercial implementation.
    pub const MVENDORID: u64 = 0;
    /// The marchid CSR is set to 0 to indicate it is not implemented.
    pub const MARCHID: u64 = 0;
    /// The mimpid CSR is set to 0 to indicate it is not implemented.
    pub const MIMPID: u64 = 0;

    pub fn new(config: Config) -> Self {
        let reset_vector = config.reset_vector;
        Self {
            config,
            registers: Registers::new(reset_vector),
            fregisters: FRegisters::new(),
            fcsr: Fcsr::new(),
            status: Status::new(),
            interrupts: Interrupts::new(),
            trap: trap::Trap::new(),
            control: control::Control::new(),
            counters: Counters::new(),
            privilege_mode: PrivilegeLevel::Machine,
            last_exception: None,
        }
    }

    /// Force this core back to its reset state.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Provide a read-only view of this core's configuration.
    ///
    /// It is not possible to modify the configuration after creation.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn fregisters(&self) -> &FRegisters {
        &self.fregisters
    }

    pub fn interrupts_mut(&mut self) -> &mut Interrupts {
        &mut self.interrupts
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Returns the current privilege mode the core is in.
    ///
    /// See also [`PrivilegeLevel`].
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    /// Advance the hart by one step: take a pending interrupt if there is one, otherwise fetch
    /// and execute a single instruction. Synchronous exceptions trap to the guest's handler.
    ///
    /// The only error is [`TrapLoopError`]: the hart faulted twice in a row at the same address
    /// with the same cause, without retiring anything in between, which means the guest has no
    /// usable trap handler and would spin forever.
    pub fn step(&mut self, bus: &mut SystemBus) -> Result<(), TrapLoopError> {
        self.counters.increment_cycle();

        if let Some(interrupt) = self.pending_interrupt() {
            trace!("taking interrupt {interrupt:?}");
            let pc = self.registers.pc();
            self.enter_trap(true, interrupt.code(), 0, pc);
            return Ok(());
        }

        let pc = self.registers.pc();
        match self.fetch_and_execute(bus, pc) {
            Ok(()) => {
                self.counters.increment_instret();
                self.last_exception = None;
                Ok(())
            }
            Err(exception) => {
                let code = exception.code();
                if self.last_exception == Some((code, pc)) {
                    return Err(TrapLoopError { code, pc });
                }
                self.last_exception = Some((code, pc));
                trace!("taking exception {exception:?} at pc {pc:#x}");
                self.enter_trap(false, code, exception.tval(), pc);
                Ok(())
            }
        }
    }

    fn fetch_and_execute(&mut self, bus: &mut SystemBus, pc: u64) -> ExecutionResult {
        let raw_instruction = self.fetch_instruction(bus, pc)?;
        self.execute_raw_instruction(bus, raw_instruction)
    }

    /// "Independent instruction fetch unit"
    ///
    /// > The base RISC-V ISA has fixed-length 32-bit instructions that must be naturally aligned
    /// > on 32-bit boundaries.
    fn fetch_instruction(&mut self, bus: &mut SystemBus, address: u64) -> Result<u32, Exception> {
        if !DataSize::Word.is_aligned(address) {
            return Err(Exception::InstructionAddressMisaligned(address));
        }
        bus.read(address, DataSize::Word)
            .map(|value| value as u32)
            .map_err(|_| Exception::InstructionAccessFault(address))
    }

    /// Execute a single instruction on this core.
    ///
    /// This only takes care of executing the instruction-specific operations, such as updating
    /// `x` registers, updating memory, updating the `pc` register, and depending on the
    /// instruction also updating CSRs. Counter updates and interrupt sampling happen in
    /// [`step`](Self::step).
    ///
    /// # Unspecified behavior
    ///
    /// > The behavior upon decoding a reserved instruction is UNSPECIFIED.
    ///
    /// This implementation chooses to raise an [`Exception::IllegalInstruction`] when
    /// `raw_instruction` has a reserved opcode.
    pub fn execute_raw_instruction(
        &mut self,
        bus: &mut SystemBus,
        raw_instruction: u32,
    ) -> ExecutionResult {
        let instruction = match Instruction::decode(raw_instruction) {
            Ok(instruction) => instruction,
            Err(_) => return Err(Exception::IllegalInstruction),
        };
        self.execute_instruction(bus, instruction)
    }

    pub fn execute_instruction(
        &mut self,
        bus: &mut SystemBus,
        instruction: Instruction,
    ) -> ExecutionResult {
        let mut executor = Executor { core: self, bus };
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImmOp::Addi => Executor::addi,
                    RegImmOp::Slti => Executor::slti,
                    RegImmOp::Sltiu => Executor::sltiu,
                    RegImmOp::Xori => Executor::xori,
                    RegImmOp::Ori => Executor::ori,
                    RegImmOp::Andi => Executor::andi,
                };
                op(&mut executor, dest, src, immediate)
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u6,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slli,
                    RegShiftImmOp::Srli => Executor::srli,
                    RegShiftImmOp::Srai => Executor::srai,
                };
                op(&mut executor, dest, src, shift_amount_u6)
            }
            Instruction::OpImm32 {
                dest,
                src,
                immediate,
            } => executor.addiw(dest, src, immediate),
            Instruction::OpShiftImm32 {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slliw,
                    RegShiftImmOp::Srli => Executor::srliw,
                    RegShiftImmOp::Srai => Executor::sraiw,
                };
                op(&mut executor, dest, src, shift_amount_u5)
            }
            Instruction::Auipc { dest, immediate } => executor.auipc(dest, immediate),
            Instruction::Lui { dest, immediate } => executor.lui(dest, immediate),
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegRegOp::Add => Executor::add,
                    RegRegOp::Slt => Executor::slt,
                    RegRegOp::Sltu => Executor::sltu,
                    RegRegOp::And => Executor::and,
                    RegRegOp::Or => Executor::or,
                    RegRegOp::Xor => Executor::xor,
                    RegRegOp::Sll => Executor::sll,
                    RegRegOp::Srl => Executor::srl,
                    RegRegOp::Sub => Executor::sub,
                    RegRegOp::Sra => Executor::sra,
                    RegRegOp::Mul => Executor::mul,
                    RegRegOp::Mulh => Executor::mulh,
                    RegRegOp::Mulhsu => Executor::mulhsu,
                    RegRegOp::Mulhu => Executor::mulhu,
                    RegRegOp::Div => Executor::div,
                    RegRegOp::Divu => Executor::divu,
                    RegRegOp::Rem => Executor::rem,
                    RegRegOp::Remu => Executor::remu,
                };
                op(&mut executor, dest, src1, src2)
            }
            Instruction::Op32 {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegReg32Op::Addw => Executor::addw,
                    RegReg32Op::Subw => Executor::subw,
                    RegReg32Op::Sllw => Executor::sllw,
                    RegReg32Op::Srlw => Executor::srlw,
                    RegReg32Op::Sraw => Executor::sraw,
                    RegReg32Op::Mulw => Executor::mulw,
                    RegReg32Op::Divw => Executor::divw,
                    RegReg32Op::Divuw => Executor::divuw,
                    RegReg32Op::Remw => Executor::remw,
                    RegReg32Op::Remuw => Executor::remuw,
                };
                op(&mut executor, dest, src1, src2)
            }
            Instruction::Jal { dest, offset } => executor.jal(dest, offset),
            Instruction::Jalr { dest, base, offset } => executor.jalr(dest, base, offset),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let op = match condition {
                    BranchCondition::Beq => Executor::beq,
                    BranchCondition::Bne => Executor::bne,
                    BranchCondition::Blt => Executor::blt,
                    BranchCondition::Bltu => Executor::bltu,
                    BranchCondition::Bge => Executor::bge,
                    BranchCondition::Bgeu => Executor::bgeu,
                };
                op(&mut executor, src1, src2, offset)
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let op = match width {
                    LoadWidth::Lb => Executor::lb,
                    LoadWidth::Lh => Executor::lh,
                    LoadWidth::Lw => Executor::lw,
                    LoadWidth::Ld => Executor::ld,
                    LoadWidth::Lbu => Executor::lbu,
                    LoadWidth::Lhu => Executor::lhu,
                    LoadWidth::Lwu => Executor::lwu,
                };
                op(&mut executor, dest, base, offset)
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let op = match width {
                    StoreWidth::Sb => Executor::sb,
                    StoreWidth::Sh => Executor::sh,
                    StoreWidth::Sw => Executor::sw,
                    StoreWidth::Sd => Executor::sd,
                };
                op(&mut executor, src, base, offset)
            }
            Instruction::LoadFp { dest, base, offset } => executor.flw(dest, base, offset),
            Instruction::StoreFp { src, base, offset } => executor.fsw(src, base, offset),
            Instruction::OpFp {
                op,
                dest,
                src1,
                src2,
                rm,
            } => executor.op_fp(op, dest, src1, src2, rm),
            Instruction::FpFused {
                op,
                dest,
                src1,
                src2,
                src3,
                rm,
            } => executor.fp_fused(op, dest, src1, src2, src3, rm),
            Instruction::Fence {
                predecessor,
                successor,
            } => executor.fence(predecessor, successor),
            Instruction::Ecall => executor.ecall(),
            Instruction::Ebreak => executor.ebreak(),
            Instruction::Mret => executor.mret(),
            Instruction::Sret => executor.sret(),
            Instruction::Wfi => executor.wfi(),
            Instruction::Csr { op, dest, csr, src } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrw,
                    CsrOp::ReadSet => Executor::csrrs,
                    CsrOp::ReadClear => Executor::csrrc,
                };
                op(&mut executor, dest, csr, src)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrwi,
                    CsrOp::ReadSet => Executor::csrrsi,
                    CsrOp::ReadClear => Executor::csrrci,
                };
                op(&mut executor, dest, csr, immediate)
            }
        }
    }

    //
    // Interrupt and trap handling
    //

    /// Returns the highest-priority interrupt that must be taken before the next fetch, if any.
    ///
    /// All traps target M-mode in this implementation (mideleg is hardwired to zero), so an
    /// interrupt is taken if it is pending and enabled, and either the hart runs below M-mode or
    /// mstatus.MIE is set.
    fn pending_interrupt(&self) -> Option<Interrupt> {
        if self.privilege_mode == PrivilegeLevel::Machine && !self.status.mie() {
            return None;
        }
        self.interrupts.highest_priority_ready()
    }

    /// Trap entry as specified for M-mode:
    ///
    /// 1. mcause ← (interrupt_flag << 63) | code
    /// 2. mepc ← `pc` (the not-yet-executed instruction for interrupts, the faulting
    ///    instruction for exceptions; for ECALL this is the ECALL itself)
    /// 3. mtval ← exception-specific value
    /// 4. mstatus.MPIE ← mstatus.MIE; mstatus.MIE ← 0; mstatus.MPP ← prior privilege
    /// 5. pc ← mtvec.base, or mtvec.base + 4·code for vectored interrupts
    fn enter_trap(&mut self, is_interrupt: bool, code: u64, tval: u64, pc: u64) {
        self.trap.write_mepc(pc, u64::MAX);
        self.trap
            .write_mcause((is_interrupt as u64) << 63 | code, u64::MAX);
        self.trap.write_mtval(tval, u64::MAX);

        self.status.set_mpie(self.status.mie());
        self.status.set_mie(false);
        self.status.set_mpp(self.privilege_mode);
        self.privilege_mode = PrivilegeLevel::Machine;

        let target = self
            .control
            .mtvec
            .trap_target(is_interrupt.then_some(code));
        *self.registers.pc_mut() = target;
    }

    /// > MRET: PC ← mepc; mstatus.MIE ← mstatus.MPIE; mstatus.MPIE ← 1;
    /// > privilege ← mstatus.MPP; mstatus.MPP ← U.
    fn return_from_m_trap(&mut self) {
        *self.registers.pc_mut() = self.trap.read_mepc();
        self.status.set_mie(self.status.mpie());
        self.status.set_mpie(true);
        let previous = self.status.mpp();
        self.status.set_mpp(PrivilegeLevel::User);
        // > If MPP is changed to a mode less privileged than M, MRET also sets MPRV=0.
        if previous != PrivilegeLevel::Machine {
            self.status.set_mprv(false);
        }
        self.privilege_mode = previous;
    }

    /// SRET, analogous to [`return_from_m_trap`](Self::return_from_m_trap) with S-mode fields.
    fn return_from_s_trap(&mut self) {
        *self.registers.pc_mut() = self.trap.read_sepc();
        self.status.set_sie(self.status.spie());
        self.status.set_spie(true);
        let previous = self.status.spp();
        self.status.set_spp(PrivilegeLevel::User);
        self.status.set_mprv(false);
        self.privilege_mode = previous;
    }

    //
    // CSR file
    //

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege_level` indicates at what privilege level the read is performed. If the CSR that
    /// is being read requires a higher privilege level (see
    /// [`csr::required_privilege_level`]), then a [`CsrAccessError::Privileged`] is returned.
    pub fn read_csr(
        &self,
        bus: &SystemBus,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<u64, CsrAccessError> {
        self.check_csr_access(specifier, privilege_level)?;
        match specifier {
            //
            // Machine info registers
            //
            csr::MISA => Ok(Self::MISA),
            csr::MVENDORID => Ok(Self::MVENDORID),
            csr::MARCHID => Ok(Self::MARCHID),
            csr::MIMPID => Ok(Self::MIMPID),
            csr::MHARTID => Ok(self.config.hart_id),
            //
            // Floating-point CSRs (require the FPU to be on)
            //
            csr::FFLAGS => Ok(self.fcsr.read_fflags()),
            csr::FRM => Ok(self.fcsr.read_frm()),
            csr::FCSR => Ok(self.fcsr.read_fcsr()),
            //
            // Counter registers
            //
            csr::CYCLE => Ok(self.counters.read_mcycle()),
            csr::INSTRET => Ok(self.counters.read_minstret()),
            csr::TIME => Ok(bus.clint().mtime()),
            csr::MCYCLE => Ok(self.counters.read_mcycle()),
            csr::MINSTRET => Ok(self.counters.read_minstret()),
            //
            // Trap setup and handling
            //
            csr::MSTATUS => Ok(self.status.read_mstatus()),
            csr::SSTATUS => Ok(self.status.read_sstatus()),
            csr::MIE => Ok(self.interrupts.read_mie()),
            csr::MIP => Ok(self.interrupts.read_mip()),
            // With mideleg hardwired to zero, the S-mode views of mie/mip are empty.
            csr::SIE => Ok(0),
            csr::SIP => Ok(0),
            csr::MTVEC => Ok(self.control.mtvec.read()),
            csr::STVEC => Ok(self.control.stvec.read()),
            csr::MSCRATCH => Ok(self.trap.read_mscratch()),
            csr::MEPC => Ok(self.trap.read_mepc()),
            csr::MCAUSE => Ok(self.trap.read_mcause()),
            csr::MTVAL => Ok(self.trap.read_mtval()),
            csr::SSCRATCH => Ok(self.trap.read_sscratch()),
            csr::SEPC => Ok(self.trap.read_sepc()),
            csr::SCAUSE => Ok(self.trap.read_scause()),
            csr::STVAL => Ok(self.trap.read_stval()),
            //
            // WARL-zero registers: delegation is not implemented (all traps target M-mode),
            // paging is not implemented, and the counters are always accessible.
            //
            csr::MEDELEG | csr::MIDELEG | csr::SATP | csr::MCOUNTEREN | csr::SCOUNTEREN => Ok(0),
            _ => Err(CsrAccessError::CsrUnsupported(specifier)),
        }
    }

    /// Write `value & mask` to a CSR, with per-CSR WARL handling.
    ///
    /// `mask` selects which bits of `value` are applied; this is how the CSRRS/CSRRC bit-set and
    /// bit-clear forms are expressed.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        value: u64,
        mask: u64,
    ) -> Result<(), CsrWriteError> {
        self.check_csr_access(specifier, privilege_level)
            .map_err(CsrWriteError::AccessError)?;
        if csr::is_read_only(specifier) {
            return Err(CsrWriteError::WriteToReadOnly);
        }
        match specifier {
            csr::FFLAGS => {
                self.fcsr.write_fflags(value, mask);
                self.status.set_fs(ExtensionContextStatus::Dirty);
            }
            csr::FRM => {
                self.fcsr.write_frm(value, mask);
                self.status.set_fs(ExtensionContextStatus::Dirty);
            }
            csr::FCSR => {
                self.fcsr.write_fcsr(value, mask);
                self.status.set_fs(ExtensionContextStatus::Dirty);
            }
            csr::MCYCLE => self.counters.write_mcycle(value, mask),
            csr::MINSTRET => self.counters.write_minstret(value, mask),
            csr::MSTATUS => self.status.write_mstatus(value, mask),
            csr::SSTATUS => self.status.write_sstatus(value, mask),
            csr::MIE => self.interrupts.write_mie(value, mask),
            csr::MIP => self.interrupts.write_mip(value, mask),
            // S-mode views of mie/mip are masked by mideleg, which is zero.
            csr::SIE | csr::SIP => {}
            csr::MTVEC => self.control.mtvec.write(value, mask),
            csr::STVEC => self.control.stvec.write(value, mask),
            csr::MSCRATCH => self.trap.write_mscratch(value, mask),
            csr::MEPC => self.trap.write_mepc(value, mask),
            csr::MCAUSE => self.trap.write_mcause(value, mask),
            csr::MTVAL => self.trap.write_mtval(value, mask),
            csr::SSCRATCH => self.trap.write_sscratch(value, mask),
            csr::SEPC => self.trap.write_sepc(value, mask),
            csr::SCAUSE => self.trap.write_scause(value, mask),
            csr::STVAL => self.trap.write_stval(value, mask),
            // WARL-zero registers ignore all writes.
            csr::MEDELEG | csr::MIDELEG | csr::SATP | csr::MCOUNTEREN | csr::SCOUNTEREN => {}
            _ => {
                return Err(CsrWriteError::AccessError(CsrAccessError::CsrUnsupported(
                    specifier,
                )))
            }
        }
        Ok(())
    }

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<(), CsrAccessError> {
        if !csr::is_valid(specifier) {
            return Err(CsrAccessError::CsrUnsupported(specifier));
        }
        let required_level = csr::required_privilege_level(specifier);
        if (privilege_level as u8) < required_level {
            return Err(CsrAccessError::Privileged {
                specifier,
                required_level,
                actual_level: privilege_level,
            });
        }
        // The floating-point CSRs are part of the FPU state and are inaccessible while the FPU
        // is off.
        if matches!(specifier, csr::FFLAGS | csr::FRM | csr::FCSR)
            && self.status.fs() == ExtensionContextStatus::Off
        {
            return Err(CsrAccessError::FpOff);
        }
        Ok(())
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrAccessError {
    #[error("unsupported CSR: {0:#05X}")]
    CsrUnsupported(CsrSpecifier),
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access specifier {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        /// The CSR for which access was requested.
        specifier: CsrSpecifier,
        /// The minimum required privilege level to access that CSR, as the raw 2-bit encoding
        /// (which may be the reserved level 2).
        required_level: u8,
        /// The actual privilege level from which the access was performed.
        actual_level: PrivilegeLevel,
    },
    /// Attempt to access a floating-point CSR while mstatus.FS is Off.
    #[error("cannot access floating-point CSR while mstatus.FS is Off")]
    FpOff,
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

/// The hart keeps faulting at the same address with the same cause, without retiring a single
/// instruction in between. This means the guest has no reachable trap handler (e.g. mtvec still
/// holds its reset value) and the emulator would spin forever.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("trap loop: cause {code} at pc {pc:#x} with no usable trap handler")]
pub struct TrapLoopError {
    pub code: u64,
    pub pc: u64,
}

/// Result of executing a single instruction. [`Ok`] if execution went normal, [`Err`] if an
/// exception occurred.
pub type ExecutionResult = Result<(), Exception>;

/// Synchronous exceptions, with the value the trap engine should expose in `mtval`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte aligned boundary in memory.
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - (*UNSPECIFIED*) Attempt to decode a reserved instruction.
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - Attempt to execute a floating-point instruction while mstatus.FS is Off.
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => 0,
            Self::InstructionAccessFault(_) => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned(_) => 4,
            Self::LoadAccessFault(_) => 5,
            Self::StoreAddressMisaligned(_) => 6,
            Self::StoreAccessFault(_) => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
        }
    }

    /// Returns the value to be written to `mtval` when this exception is taken: the faulting
    /// address for access and alignment faults, zero otherwise.
    pub fn tval(&self) -> u64 {
        match *self {
            Self::InstructionAddressMisaligned(address)
            | Self::InstructionAccessFault(address)
            | Self::LoadAddressMisaligned(address)
            | Self::LoadAccessFault(address)
            | Self::StoreAddressMisaligned(address)
            | Self::StoreAccessFault(address) => address,
            _ => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftwareInterrupt = 1,
    MachineSoftwareInterrupt = 3,
    SupervisorTimerInterrupt = 5,
    MachineTimerInterrupt = 7,
    SupervisorExternalInterrupt = 9,
    MachineExternalInterrupt = 11,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt.
    pub fn code(&self) -> u64 {
        *self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Specifier;
    use crate::resources::uart::Uart;

    fn fixture() -> (Core, SystemBus) {
        let core = Core::new(Config::default());
        let bus = SystemBus::new(Uart::new(Box::new(std::io::sink())), None);
        (core, bus)
    }

    fn set_x(core: &mut Core, index: u8, value: u64) {
        core.registers_mut()
            .set_x(Specifier::new(index).unwrap(), value);
    }

    fn x(core: &Core, index: u8) -> u64 {
        core.registers().x(Specifier::new(index).unwrap())
    }

    #[test]
    fn test_division_edge_cases() {
        let (mut core, mut bus) = fixture();

        // div x3, x1, x2 with x2 == 0: quotient is all ones.
        set_x(&mut core, 1, 42);
        set_x(&mut core, 2, 0);
        core.execute_raw_instruction(&mut bus, 0x0220_C1B3).unwrap();
        assert_eq!(u64::MAX, x(&core, 3));

        // rem x3, x1, x2 with x2 == 0: remainder is the dividend.
        core.execute_raw_instruction(&mut bus, 0x0220_E1B3).unwrap();
        assert_eq!(42, x(&core, 3));

        // Signed overflow: i64::MIN / -1 yields the dividend, remainder 0.
        set_x(&mut core, 1, i64::MIN as u64);
        set_x(&mut core, 2, -1i64 as u64);
        core.execute_raw_instruction(&mut bus, 0x0220_C1B3).unwrap();
        assert_eq!(i64::MIN as u64, x(&core, 3));
        core.execute_raw_instruction(&mut bus, 0x0220_E1B3).unwrap();
        assert_eq!(0, x(&core, 3));
    }

    #[test]
    fn test_mulh() {
        let (mut core, mut bus) = fixture();
        // mulh x3, x1, x2: upper doubleword of the signed product.
        set_x(&mut core, 1, -1i64 as u64);
        set_x(&mut core, 2, -1i64 as u64);
        core.execute_raw_instruction(&mut bus, 0x0220_91B3).unwrap();
        assert_eq!(0, x(&core, 3)); // (-1) * (-1) = 1, upper bits zero
        set_x(&mut core, 1, i64::MIN as u64);
        set_x(&mut core, 2, 2);
        core.execute_raw_instruction(&mut bus, 0x0220_91B3).unwrap();
        assert_eq!(-1i64 as u64, x(&core, 3));
    }

    #[test]
    fn test_w_ops_sign_extend() {
        let (mut core, mut bus) = fixture();
        // addw x3, x1, x2: 32-bit wrap, sign-extended.
        set_x(&mut core, 1, 0x7FFF_FFFF);
        set_x(&mut core, 2, 1);
        core.execute_raw_instruction(&mut bus, 0x0020_81BB).unwrap();
        assert_eq!(0xFFFF_FFFF_8000_0000, x(&core, 3));

        // sraw x3, x1, x2: arithmetic shift of the low word.
        set_x(&mut core, 1, 0x8000_0000);
        set_x(&mut core, 2, 4);
        core.execute_raw_instruction(&mut bus, 0x4020_D1BB).unwrap();
        assert_eq!(0xFFFF_FFFF_F800_0000, x(&core, 3));
    }

    #[test]
    fn test_fp_requires_fs_on() {
        let (mut core, mut bus) = fixture();
        // fmv.w.x f1, x1 with mstatus.FS == Off must trap.
        assert_eq!(
            Err(Exception::IllegalInstruction),
            core.execute_raw_instruction(&mut bus, 0xF000_80D3)
        );
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 13, 3 << 13)
            .unwrap();
        core.execute_raw_instruction(&mut bus, 0xF000_80D3).unwrap();
        // Writing FP state marks FS dirty, which also sets mstatus.SD.
        assert_eq!(ExtensionContextStatus::Dirty, core.status.fs());
        assert!(core.status.sd());
    }

    #[test]
    fn test_fp_add_and_convert() {
        let (mut core, mut bus) = fixture();
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 13, 3 << 13)
            .unwrap();

        // f1 = 1.5f32, f2 = 2.25f32 through fmv.w.x.
        set_x(&mut core, 1, 1.5f32.to_bits() as u64);
        core.execute_raw_instruction(&mut bus, 0xF000_80D3).unwrap(); // fmv.w.x f1, x1
        set_x(&mut core, 1, 2.25f32.to_bits() as u64);
        core.execute_raw_instruction(&mut bus, 0xF000_8153).unwrap(); // fmv.w.x f2, x1

        // fadd.s f3, f1, f2
        core.execute_raw_instruction(&mut bus, 0x0020_81D3).unwrap();
        assert_eq!(
            3.75f32.to_bits(),
            core.fregisters().f32_bits(Specifier::new(3u8).unwrap())
        );

        // fcvt.w.s x2, f3 (round towards zero) = 3
        core.execute_raw_instruction(&mut bus, 0xC001_9153).unwrap();
        assert_eq!(3, x(&core, 2));
        // Inexact must be accrued in fflags.
        assert_ne!(
            0,
            core.read_csr(&bus, csr::FFLAGS, PrivilegeLevel::Machine)
                .unwrap()
                & 1
        );
    }

    #[test]
    fn test_csr_masked_write_readback() {
        let (mut core, bus) = fixture();
        core.write_csr(csr::MSCRATCH, PrivilegeLevel::Machine, 0x1234_5678, u64::MAX)
            .unwrap();
        assert_eq!(
            0x1234_5678,
            core.read_csr(&bus, csr::MSCRATCH, PrivilegeLevel::Machine)
                .unwrap()
        );
        // mepc's low bit is hardwired to zero.
        core.write_csr(csr::MEPC, PrivilegeLevel::Machine, 0x8000_0003, u64::MAX)
            .unwrap();
        assert_eq!(
            0x8000_0002,
            core.read_csr(&bus, csr::MEPC, PrivilegeLevel::Machine).unwrap()
        );
        // Device-driven mip bits ignore writes.
        core.write_csr(csr::MIP, PrivilegeLevel::Machine, 1 << 7 | 1 << 11, u64::MAX)
            .unwrap();
        assert_eq!(
            0,
            core.read_csr(&bus, csr::MIP, PrivilegeLevel::Machine).unwrap()
        );
    }

    #[test]
    fn test_csr_privilege_and_read_only_rules() {
        let (mut core, bus) = fixture();
        // M-mode CSRs are not accessible from U-mode.
        assert!(matches!(
            core.read_csr(&bus, csr::MSTATUS, PrivilegeLevel::User),
            Err(CsrAccessError::Privileged { .. })
        ));
        // Writes to read-only CSRs fail regardless of privilege.
        assert!(matches!(
            core.write_csr(csr::MHARTID, PrivilegeLevel::Machine, 1, u64::MAX),
            Err(CsrWriteError::WriteToReadOnly)
        ));
        // Unimplemented CSRs are rejected.
        assert!(matches!(
            core.read_csr(&bus, 0x123, PrivilegeLevel::Machine),
            Err(CsrAccessError::CsrUnsupported(0x123))
        ));
    }

    #[test]
    fn test_interrupt_not_taken_with_mie_clear() {
        let (mut core, mut bus) = fixture();
        // Load a nop at the reset vector so steps retire normally.
        let nop = 0x0000_0013u32;
        let reset = core.config().reset_vector - crate::system_bus::map::RAM_BASE;
        assert!(bus.ram_mut().write_bytes(reset, &nop.to_le_bytes()));

        core.interrupts_mut().set_m_timer(true);
        core.write_csr(csr::MIE, PrivilegeLevel::Machine, 1 << 7, u64::MAX)
            .unwrap();

        // mstatus.MIE is clear: the pending interrupt is not delivered in M-mode.
        core.step(&mut bus).unwrap();
        assert_eq!(core.config().reset_vector + 4, core.registers().pc());

        // Setting mstatus.MIE delivers it before the next fetch.
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, 1 << 3)
            .unwrap();
        core.step(&mut bus).unwrap();
        assert_eq!(
            1 << 63 | 7,
            core.read_csr(&bus, csr::MCAUSE, PrivilegeLevel::Machine).unwrap()
        );
        assert_eq!(PrivilegeLevel::Machine, core.privilege_mode());
    }
}
