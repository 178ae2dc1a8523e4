use crate::core::csr::CsrSpecifier;
use crate::registers::Specifier;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded form.
///
/// Covers RV64IMF plus the Zicsr extension and the privileged trap-return instructions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u6: u32,
    },
    /// `addiw` (the only non-shift instruction of OP-IMM-32).
    OpImm32 {
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm32 {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Op32 {
        op: RegReg32Op,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    /// `flw`
    LoadFp {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    /// `fsw`
    StoreFp {
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    OpFp {
        op: FpOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        rm: u8,
    },
    FpFused {
        op: FpFusedOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
        rm: u8,
    },
    Fence {
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    },
    Ecall,
    Ebreak,
    Mret,
    Sret,
    Wfi,
    Csr {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    },
    Csri {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
    // M standard extension
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegReg32Op {
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    // M standard extension
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
    Sd,
}

/// Single-precision computational and transfer operations of the F extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpOp {
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fsqrt,
    Fsgnj,
    Fsgnjn,
    Fsgnjx,
    Fmin,
    Fmax,
    /// `fcvt.w.s`
    FcvtWS,
    /// `fcvt.wu.s`
    FcvtWuS,
    /// `fcvt.l.s`
    FcvtLS,
    /// `fcvt.lu.s`
    FcvtLuS,
    /// `fcvt.s.w`
    FcvtSW,
    /// `fcvt.s.wu`
    FcvtSWu,
    /// `fcvt.s.l`
    FcvtSL,
    /// `fcvt.s.lu`
    FcvtSLu,
    /// `fmv.x.w`
    FmvXW,
    /// `fmv.w.x`
    FmvWX,
    Feq,
    Flt,
    Fle,
    Fclass,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpFusedOp {
    Fmadd,
    Fmsub,
    Fnmsub,
    Fnmadd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FenceOrderCombination {
    pub device_input: bool,
    pub device_output: bool,
    pub memory_reads: bool,
    pub memory_writes: bool,
}

impl Instruction {
    pub fn decode(raw_instruction: u32) -> Result<Self, DecodeError> {
        match opcode(raw_instruction).ok_or(DecodeError::UnsupportedOpcode)? {
            Opcode::OpImm => match i_funct(raw_instruction) {
                Some(op) => Ok(Self::OpImm {
                    op,
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                None => match i_shfunct(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u6: shamt6(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::OpImm32 => match funct3(raw_instruction) {
                0b000 => Ok(Self::OpImm32 {
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                _ => match i_shfunct32(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm32 {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u5: shamt5(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::Auipc => Ok(Self::Auipc {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Lui => Ok(Self::Lui {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Op => match r_funct(raw_instruction) {
                Some(op) => Ok(Self::Op {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Op32 => match r_funct32(raw_instruction) {
                Some(op) => Ok(Self::Op32 {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Jal => Ok(Self::Jal {
                dest: rd(raw_instruction),
                offset: j_imm(raw_instruction),
            }),
            Opcode::Jalr => match funct3(raw_instruction) {
                0b000 => Ok(Self::Jalr {
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Branch => match b_funct(raw_instruction) {
                Some(condition) => Ok(Self::Branch {
                    condition,
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    offset: b_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Load => match i_width(raw_instruction) {
                Some(width) => Ok(Self::Load {
                    width,
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Store => match s_width(raw_instruction) {
                Some(width) => Ok(Self::Store {
                    width,
                    src: rs2(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: s_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::LoadFp => match funct3(raw_instruction) {
                // Only single-precision loads exist with just the F extension.
                0b010 => Ok(Self::LoadFp {
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::StoreFp => match funct3(raw_instruction) {
                0b010 => Ok(Self::StoreFp {
                    src: rs2(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: s_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::OpFp => match fp_funct(raw_instruction) {
                Some(op) => Ok(Self::OpFp {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    rm: funct3(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Madd | Opcode::Msub | Opcode::Nmsub | Opcode::Nmadd => {
                // fmt field (bits 26:25) must select single precision.
                if (raw_instruction >> 25) & 0b11 != 0b00 {
                    return Err(DecodeError::IllegalInstruction);
                }
                let op = match opcode(raw_instruction).unwrap() {
                    Opcode::Madd => FpFusedOp::Fmadd,
                    Opcode::Msub => FpFusedOp::Fmsub,
                    Opcode::Nmsub => FpFusedOp::Fnmsub,
                    Opcode::Nmadd => FpFusedOp::Fnmadd,
                    _ => unreachable!(),
                };
                Ok(Self::FpFused {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    src3: rs3(raw_instruction),
                    rm: funct3(raw_instruction),
                })
            }
            Opcode::MiscMem => {
                match funct3(raw_instruction) {
                    0b000 => {
                        // All unused fields in the FENCE instruction encoding are reserved for
                        // future use. According to the spec, they should be treated as normal
                        // fence instructions for forward compatibility, so fm, rd, and rs1 are
                        // not validated here.
                        let predecessor = FenceOrderCombination {
                            device_input: (raw_instruction >> 27) & 0b1 == 1,
                            device_output: (raw_instruction >> 26) & 0b1 == 1,
                            memory_reads: (raw_instruction >> 25) & 0b1 == 1,
                            memory_writes: (raw_instruction >> 24) & 0b1 == 1,
                        };
                        let successor = FenceOrderCombination {
                            device_input: (raw_instruction >> 23) & 0b1 == 1,
                            device_output: (raw_instruction >> 22) & 0b1 == 1,
                            memory_reads: (raw_instruction >> 21) & 0b1 == 1,
                            memory_writes: (raw_instruction >> 20) & 0b1 == 1,
                        };
                        Ok(Self::Fence {
                            predecessor,
                            successor,
                        })
                    }
                    _ => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::System => match funct3(raw_instruction) {
                0b000 => match i_sys(raw_instruction) {
                    Some(sys) => Ok(match sys {
                        Sys::Ecall => Self::Ecall,
                        Sys::Ebreak => Self::Ebreak,
                        Sys::Mret => Self::Mret,
                        Sys::Sret => Self::Sret,
                        Sys::Wfi => Self::Wfi,
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
                f3 => {
                    let op = match f3 & 0b11 {
                        0b01 => CsrOp::ReadWrite,
                        0b10 => CsrOp::ReadSet,
                        0b11 => CsrOp::ReadClear,
                        _ => return Err(DecodeError::IllegalInstruction),
                    };
                    let csr = csr_specifier(raw_instruction);
                    let dest = rd(raw_instruction);
                    if f3 & 0b100 == 0 {
                        Ok(Self::Csr {
                            op,
                            dest,
                            csr,
                            src: rs1(raw_instruction),
                        })
                    } else {
                        Ok(Self::Csri {
                            op,
                            dest,
                            csr,
                            immediate: u32::from(rs1(raw_instruction)),
                        })
                    }
                }
            },
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has unsupported opcode")]
    UnsupportedOpcode,
    #[error("illegal instruction")]
    IllegalInstruction,
}

/// Returns the 7-bit *opcode* value of the instruction, or `None` if it isn't supported.
fn opcode(raw_instruction: u32) -> Option<Opcode> {
    #[allow(clippy::unusual_byte_groupings)]
    match raw_instruction & 0x7F {
        0b00_000_11 => Some(Opcode::Load),
        0b00_001_11 => Some(Opcode::LoadFp),
        // custom-0
        0b00_011_11 => Some(Opcode::MiscMem),
        0b00_100_11 => Some(Opcode::OpImm),
        0b00_101_11 => Some(Opcode::Auipc),
        0b00_110_11 => Some(Opcode::OpImm32),
        // 48b
        0b01_000_11 => Some(Opcode::Store),
        0b01_001_11 => Some(Opcode::StoreFp),
        // custom-1
        // Amo = 0b01_011_11,
        0b01_100_11 => Some(Opcode::Op),
        0b01_101_11 => Some(Opcode::Lui),
        0b01_110_11 => Some(Opcode::Op32),
        // 64b
        0b10_000_11 => Some(Opcode::Madd),
        0b10_001_11 => Some(Opcode::Msub),
        0b10_010_11 => Some(Opcode::Nmsub),
        0b10_011_11 => Some(Opcode::Nmadd),
        0b10_100_11 => Some(Opcode::OpFp),
        // reserved
        // custom-2/rv128
        // 48b
        0b11_000_11 => Some(Opcode::Branch),
        0b11_001_11 => Some(Opcode::Jalr),
        // reserved
        0b11_011_11 => Some(Opcode::Jal),
        0b11_100_11 => Some(Opcode::System),
        // reserved
        // custom-3/rv128
        // >= 80b
        _ => None,
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type instructions.
fn rd(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type instructions.
fn rs1(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 20) & 0x1F) as u8)
}

/// Returns the 5-bit *rs3* value for R4-type instructions.
fn rs3(raw_instruction: u32) -> Specifier {
    Specifier::from_u5((raw_instruction >> 27) as u8)
}

fn i_funct(raw_instruction: u32) -> Option<RegImmOp> {
    match funct3(raw_instruction) {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

/// RV64 shift-immediate decoding uses a 6-bit funct field (bits `31:26`), leaving a 6-bit shamt.
fn i_shfunct(raw_instruction: u32) -> Option<RegShiftImmOp> {
    match (raw_instruction >> 26, funct3(raw_instruction)) {
        (0b000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b010000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_shfunct32(raw_instruction: u32) -> Option<RegShiftImmOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b0000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b0100000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_sys(raw_instruction: u32) -> Option<Sys> {
    if u8::from(rd(raw_instruction)) != 0 || u8::from(rs1(raw_instruction)) != 0 {
        return None;
    }
    match (funct7(raw_instruction), u8::from(rs2(raw_instruction))) {
        (0b0000000, 0b00000) => Some(Sys::Ecall),
        (0b0000000, 0b00001) => Some(Sys::Ebreak),
        (0b0001000, 0b00010) => Some(Sys::Sret),
        (0b0001000, 0b00101) => Some(Sys::Wfi),
        (0b0011000, 0b00010) => Some(Sys::Mret),
        _ => None,
    }
}

fn i_width(raw_instruction: u32) -> Option<LoadWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b011 => Some(LoadWidth::Ld),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        0b110 => Some(LoadWidth::Lwu),
        _ => None,
    }
}

fn s_width(raw_instruction: u32) -> Option<StoreWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        0b011 => Some(StoreWidth::Sd),
        _ => None,
    }
}

fn r_funct(raw_instruction: u32) -> Option<RegRegOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        (0b0000001, 0b000) => Some(RegRegOp::Mul),
        (0b0000001, 0b001) => Some(RegRegOp::Mulh),
        (0b0000001, 0b010) => Some(RegRegOp::Mulhsu),
        (0b0000001, 0b011) => Some(RegRegOp::Mulhu),
        (0b0000001, 0b100) => Some(RegRegOp::Div),
        (0b0000001, 0b101) => Some(RegRegOp::Divu),
        (0b0000001, 0b110) => Some(RegRegOp::Rem),
        (0b0000001, 0b111) => Some(RegRegOp::Remu),
        _ => None,
    }
}

fn r_funct32(raw_instruction: u32) -> Option<RegReg32Op> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegReg32Op::Addw),
        (0b0000000, 0b001) => Some(RegReg32Op::Sllw),
        (0b0000000, 0b101) => Some(RegReg32Op::Srlw),
        (0b0100000, 0b000) => Some(RegReg32Op::Subw),
        (0b0100000, 0b101) => Some(RegReg32Op::Sraw),
        (0b0000001, 0b000) => Some(RegReg32Op::Mulw),
        (0b0000001, 0b100) => Some(RegReg32Op::Divw),
        (0b0000001, 0b101) => Some(RegReg32Op::Divuw),
        (0b0000001, 0b110) => Some(RegReg32Op::Remw),
        (0b0000001, 0b111) => Some(RegReg32Op::Remuw),
        _ => None,
    }
}

fn fp_funct(raw_instruction: u32) -> Option<FpOp> {
    let rs2_raw = u8::from(rs2(raw_instruction));
    match (funct7(raw_instruction), funct3(raw_instruction), rs2_raw) {
        (0b0000000, _, _) => Some(FpOp::Fadd),
        (0b0000100, _, _) => Some(FpOp::Fsub),
        (0b0001000, _, _) => Some(FpOp::Fmul),
        (0b0001100, _, _) => Some(FpOp::Fdiv),
        (0b0101100, _, 0b00000) => Some(FpOp::Fsqrt),
        (0b0010000, 0b000, _) => Some(FpOp::Fsgnj),
        (0b0010000, 0b001, _) => Some(FpOp::Fsgnjn),
        (0b0010000, 0b010, _) => Some(FpOp::Fsgnjx),
        (0b0010100, 0b000, _) => Some(FpOp::Fmin),
        (0b0010100, 0b001, _) => Some(FpOp::Fmax),
        (0b1100000, _, 0b00000) => Some(FpOp::FcvtWS),
        (0b1100000, _, 0b00001) => Some(FpOp::FcvtWuS),
        (0b1100000, _, 0b00010) => Some(FpOp::FcvtLS),
        (0b1100000, _, 0b00011) => Some(FpOp::FcvtLuS),
        (0b1101000, _, 0b00000) => Some(FpOp::FcvtSW),
        (0b1101000, _, 0b00001) => Some(FpOp::FcvtSWu),
        (0b1101000, _, 0b00010) => Some(FpOp::FcvtSL),
        (0b1101000, _, 0b00011) => Some(FpOp::FcvtSLu),
        (0b1110000, 0b000, 0b00000) => Some(FpOp::FmvXW),
        (0b1110000, 0b001, 0b00000) => Some(FpOp::Fclass),
        (0b1111000, 0b000, 0b00000) => Some(FpOp::FmvWX),
        (0b1010000, 0b010, _) => Some(FpOp::Feq),
        (0b1010000, 0b001, _) => Some(FpOp::Flt),
        (0b1010000, 0b000, _) => Some(FpOp::Fle),
        _ => None,
    }
}

fn b_funct(raw_instruction: u32) -> Option<BranchCondition> {
    match funct3(raw_instruction) {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type instructions.
fn funct3(raw_instruction: u32) -> u8 {
    ((raw_instruction >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw_instruction: u32) -> u8 {
    (raw_instruction >> 25) as u8
}

/// Returns the 6-bit *shamt* value for RV64 shift-immediate instructions.
fn shamt6(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x3F
}

/// Returns the 5-bit *shamt* value for the `*w` shift-immediate instructions.
fn shamt5(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x1F
}

/// Returns the 12-bit CSR address held in the I-immediate field.
fn csr_specifier(raw_instruction: u32) -> CsrSpecifier {
    (raw_instruction >> 20) as CsrSpecifier
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw_instruction: u32) -> i32 {
    raw_instruction as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw_instruction: u32) -> i32 {
    let imm_11_5 = raw_instruction & 0xFE00_0000;
    let imm_4_0 = raw_instruction & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw_instruction: u32) -> i32 {
    let imm_12 = raw_instruction & 0x8000_0000;
    let imm_10_5 = raw_instruction & 0x7E00_0000;
    let imm_4_1 = raw_instruction & 0x0000_0F00;
    let imm_11 = raw_instruction & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw_instruction: u32) -> i32 {
    (raw_instruction & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw_instruction: u32) -> i32 {
    let imm_20 = raw_instruction & 0x8000_0000;
    let imm_10_1 = raw_instruction & 0x7FE0_0000;
    let imm_11 = raw_instruction & 0x0010_0000;
    let imm_19_12 = raw_instruction & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Opcode {
    OpImm,
    OpImm32,
    Auipc,
    Lui,
    Op,
    Op32,
    Jal,
    Jalr,
    Branch,
    Load,
    Store,
    LoadFp,
    StoreFp,
    OpFp,
    Madd,
    Msub,
    Nmsub,
    Nmadd,
    MiscMem,
    System,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Sys {
    Ecall,
    Ebreak,
    Mret,
    Sret,
    Wfi,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i_imm() {
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        assert_eq!(-42, i_imm((-42_i32 << 20) as u32));
        // Check other bits are ignored
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF1_2345));
        assert_eq!(1209, i_imm((1209 << 20) | 0x000C_D10A));
    }

    #[test]
    fn test_s_imm() {
        assert_eq!(0, s_imm(0x0000_0000));
        // imm[11:5] lives in bits 31:25, imm[4:0] in bits 11:7; all other bits are ignored.
        assert_eq!(-1, s_imm(0xFE00_0F80));
        assert_eq!(-8, s_imm(0xFE00_0C00));
        assert_eq!(2047, s_imm(0x7E00_0F80));
        assert_eq!(-2048, s_imm(0x8000_0000));
        assert_eq!(0, s_imm(0x01FF_F07F));
    }

    #[test]
    fn test_decode_addi() {
        // addi x5, x6, -3
        let instruction = Instruction::decode(0xFFD3_0293).unwrap();
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
                immediate: -3,
            },
            instruction
        );
    }

    #[test]
    fn test_decode_rv64_shifts() {
        // slli x1, x2, 63 (6-bit shamt only exists on RV64)
        let instruction = Instruction::decode(0x03F1_1093).unwrap();
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest: Specifier::from_u5(1),
                src: Specifier::from_u5(2),
                shift_amount_u6: 63,
            },
            instruction
        );
        // sraiw x1, x2, 31
        let instruction = Instruction::decode(0x41F1_509B).unwrap();
        assert_eq!(
            Instruction::OpShiftImm32 {
                op: RegShiftImmOp::Srai,
                dest: Specifier::from_u5(1),
                src: Specifier::from_u5(2),
                shift_amount_u5: 31,
            },
            instruction
        );
    }

    #[test]
    fn test_decode_loads_stores() {
        // ld x7, 16(x8)
        let instruction = Instruction::decode(0x0104_3383).unwrap();
        assert_eq!(
            Instruction::Load {
                width: LoadWidth::Ld,
                dest: Specifier::from_u5(7),
                base: Specifier::from_u5(8),
                offset: 16,
            },
            instruction
        );
        // sd x7, -8(x8)
        let instruction = Instruction::decode(0xFE74_3C23).unwrap();
        assert_eq!(
            Instruction::Store {
                width: StoreWidth::Sd,
                src: Specifier::from_u5(7),
                base: Specifier::from_u5(8),
                offset: -8,
            },
            instruction
        );
    }

    #[test]
    fn test_decode_muldiv() {
        // mul x3, x4, x5
        let instruction = Instruction::decode(0x0252_01B3).unwrap();
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Mul,
                dest: Specifier::from_u5(3),
                src1: Specifier::from_u5(4),
                src2: Specifier::from_u5(5),
            },
            instruction
        );
        // divw x3, x4, x5
        let instruction = Instruction::decode(0x0252_41BB).unwrap();
        assert_eq!(
            Instruction::Op32 {
                op: RegReg32Op::Divw,
                dest: Specifier::from_u5(3),
                src1: Specifier::from_u5(4),
                src2: Specifier::from_u5(5),
            },
            instruction
        );
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(Instruction::Ecall, Instruction::decode(0x0000_0073).unwrap());
        assert_eq!(Instruction::Ebreak, Instruction::decode(0x0010_0073).unwrap());
        assert_eq!(Instruction::Mret, Instruction::decode(0x3020_0073).unwrap());
        assert_eq!(Instruction::Sret, Instruction::decode(0x1020_0073).unwrap());
        assert_eq!(Instruction::Wfi, Instruction::decode(0x1050_0073).unwrap());
    }

    #[test]
    fn test_decode_csr() {
        // csrrw x1, mscratch, x2
        let instruction = Instruction::decode(0x3401_10F3).unwrap();
        assert_eq!(
            Instruction::Csr {
                op: CsrOp::ReadWrite,
                dest: Specifier::from_u5(1),
                csr: 0x340,
                src: Specifier::from_u5(2),
            },
            instruction
        );
        // csrrsi x0, mstatus, 8
        let instruction = Instruction::decode(0x3004_6073).unwrap();
        assert_eq!(
            Instruction::Csri {
                op: CsrOp::ReadSet,
                dest: Specifier::X0,
                csr: 0x300,
                immediate: 8,
            },
            instruction
        );
    }

    #[test]
    fn test_decode_float() {
        // fadd.s f1, f2, f3 (rm = rne)
        let instruction = Instruction::decode(0x0031_00D3).unwrap();
        assert_eq!(
            Instruction::OpFp {
                op: FpOp::Fadd,
                dest: Specifier::from_u5(1),
                src1: Specifier::from_u5(2),
                src2: Specifier::from_u5(3),
                rm: 0,
            },
            instruction
        );
        // fmadd.s f1, f2, f3, f4 (rm = dyn)
        let instruction = Instruction::decode(0x2031_70C3).unwrap();
        assert_eq!(
            Instruction::FpFused {
                op: FpFusedOp::Fmadd,
                dest: Specifier::from_u5(1),
                src1: Specifier::from_u5(2),
                src2: Specifier::from_u5(3),
                src3: Specifier::from_u5(4),
                rm: 0b111,
            },
            instruction
        );
        // flw f5, 0(x10)
        let instruction = Instruction::decode(0x0005_2287).unwrap();
        assert_eq!(
            Instruction::LoadFp {
                dest: Specifier::from_u5(5),
                base: Specifier::from_u5(10),
                offset: 0,
            },
            instruction
        );
    }
}
