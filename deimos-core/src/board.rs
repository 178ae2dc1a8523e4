//! Ties the hart and the interconnect together into a virt-class board, and provides the
//! run/step loop.

use std::io::Write;
use std::path::PathBuf;

use log::{debug, info};
use thiserror::Error;

use crate::core::{Config, Core, TrapLoopError};
use crate::registers::{FRegisters, Registers};
use crate::resources::uart::Uart;
use crate::resources::virtio::block::BlockBackend;
use crate::resources::virtio::VirtioBlock;
use crate::system_bus::{context, map, SystemBus};
use crate::PrivilegeLevel;

/// Everything needed to build a [`Board`].
///
/// The kernel image itself is loaded separately through [`Board::load_physical`], since ELF
/// parsing is the front end's concern.
pub struct BoardConfig {
    /// Initial program counter; for ELF guests, the entry point.
    pub reset_vector: u64,
    /// Backing image for the VirtIO block device, if one should be present.
    pub block_image: Option<PathBuf>,
    /// Sink for UART transmit data.
    pub uart_output: Box<dyn Write>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            reset_vector: map::RAM_BASE,
            block_image: None,
            uart_output: Box::new(std::io::stdout()),
        }
    }
}

/// Why [`Board::run`] returned.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Halt {
    /// The guest stored the shutdown code to the power controller.
    PowerOff,
    /// The step budget passed to [`Board::run`] was exhausted.
    StepBudgetExhausted,
}

/// Outcome of a single [`Board::step`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepOutcome {
    Continue,
    PowerOff,
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("cannot open block image: {0}")]
    BlockImage(#[from] std::io::Error),
    #[error("image does not fit in RAM at {address:#x} ({size} bytes)")]
    ImageOutOfRange { address: u64, size: usize },
}

/// A single-hart RV64 board in the mold of QEMU's `virt` machine: RAM, a 16550-style UART, a
/// power controller, CLINT, PLIC, and an optional VirtIO-MMIO block device.
///
/// Everything is deterministic: for a given image and backing file, the retired instruction
/// stream is fixed. Devices observe time only through the per-instruction tick.
#[derive(Debug)]
pub struct Board {
    core: Core,
    bus: SystemBus,
}

impl Board {
    pub fn new(config: BoardConfig) -> Result<Self, BoardError> {
        let virtio = match &config.block_image {
            Some(path) => {
                let backend = BlockBackend::open(path)?;
                info!(
                    "block device backed by {} ({} sectors)",
                    path.display(),
                    backend.capacity_sectors()
                );
                Some(VirtioBlock::new(backend))
            }
            None => None,
        };
        let bus = SystemBus::new(Uart::new(config.uart_output), virtio);
        let core = Core::new(Config {
            hart_id: 0,
            reset_vector: config.reset_vector,
        });
        debug!("board reset, pc = {:#x}", config.reset_vector);
        Ok(Self { core, bus })
    }

    /// Copy `data` into RAM at the guest-physical address `address`.
    pub fn load_physical(&mut self, address: u64, data: &[u8]) -> Result<(), BoardError> {
        let out_of_range = || BoardError::ImageOutOfRange {
            address,
            size: data.len(),
        };
        let offset = address.checked_sub(map::RAM_BASE).ok_or_else(out_of_range)?;
        if !self.bus.ram_mut().write_bytes(offset, data) {
            return Err(out_of_range());
        }
        Ok(())
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn registers(&self) -> &Registers {
        self.core.registers()
    }

    pub fn fregisters(&self) -> &FRegisters {
        self.core.fregisters()
    }

    pub fn pc(&self) -> u64 {
        self.core.registers().pc()
    }

    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.core.privilege_mode()
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    /// Queue a byte on the UART receive side.
    pub fn push_uart_input(&mut self, byte: u8) {
        self.bus.uart_mut().push_input(byte);
    }

    /// Read guest memory without simulating a bus access. Returns `None` outside RAM.
    pub fn peek_ram(&self, address: u64, buf: &mut [u8]) -> Option<()> {
        let offset = address.checked_sub(map::RAM_BASE)?;
        self.bus.ram().read_bytes(offset, buf).then_some(())
    }

    /// Advance the board by one instruction:
    ///
    /// 1. tick the CLINT (and the other devices) by one,
    /// 2. drain the device interrupt lines into the PLIC,
    /// 3. mirror the CLINT/PLIC lines into mip,
    /// 4. let the hart take a pending interrupt or execute one instruction,
    /// 5. report the power latch.
    pub fn step(&mut self) -> Result<StepOutcome, EmulatorError> {
        self.bus.tick();

        let interrupts = self.core.interrupts_mut();
        interrupts.set_m_timer(self.bus.clint().mti_line());
        interrupts.set_m_soft(self.bus.clint().msi_line());
        interrupts.set_m_external(self.bus.plic().irq_line(context::HART0_M));
        interrupts.set_s_external(self.bus.plic().irq_line(context::HART0_S));

        self.core.step(&mut self.bus)?;

        if self.bus.power().off_requested() {
            Ok(StepOutcome::PowerOff)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    /// Run until the guest powers off or `max_steps` instructions have been attempted.
    pub fn run(&mut self, max_steps: u64) -> Result<Halt, EmulatorError> {
        for _ in 0..max_steps {
            if self.step()? == StepOutcome::PowerOff {
                return Ok(Halt::PowerOff);
            }
        }
        Ok(Halt::StepBudgetExhausted)
    }
}

/// Unrecoverable emulator errors. Guest-visible problems (faults, interrupts, device errors)
/// never surface here; they are always delivered to the guest in-band.
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error(transparent)]
    TrapLoop(#[from] TrapLoopError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_bus::map;

    /// Minimal machine-code assembler for the tests; enough of RV64I to write guests.
    pub(crate) mod asm {
        pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
            (imm as u32) << 20 | rs1 << 15 | rd << 7 | 0x13
        }

        pub fn lui(rd: u32, imm20: u32) -> u32 {
            imm20 << 12 | rd << 7 | 0x37
        }

        pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
            shamt << 20 | rs1 << 15 | 0b001 << 12 | rd << 7 | 0x13
        }

        pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
            rs2 << 20 | rs1 << 15 | rd << 7 | 0x33
        }

        pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
            (imm as u32) << 20 | rs1 << 15 | 0b011 << 12 | rd << 7 | 0x03
        }

        pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
            let imm = imm as u32;
            (imm >> 5) << 25 | rs2 << 20 | rs1 << 15 | 0b010 << 12 | (imm & 0x1F) << 7 | 0x23
        }

        pub fn jal(rd: u32, offset: i32) -> u32 {
            let offset = offset as u32;
            (offset >> 20 & 1) << 31
                | (offset >> 1 & 0x3FF) << 21
                | (offset >> 11 & 1) << 20
                | (offset >> 12 & 0xFF) << 12
                | rd << 7
                | 0x6F
        }

        pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
            csr << 20 | rs1 << 15 | 0b001 << 12 | rd << 7 | 0x73
        }

        pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
            csr << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0x73
        }

        pub fn ecall() -> u32 {
            0x0000_0073
        }

        pub fn mret() -> u32 {
            0x3020_0073
        }

        /// `li` for values that fit in 12 bits.
        pub fn li(rd: u32, imm: i32) -> u32 {
            addi(rd, 0, imm)
        }
    }

    pub(crate) fn board() -> Board {
        Board::new(BoardConfig {
            reset_vector: map::RAM_BASE,
            block_image: None,
            uart_output: Box::new(std::io::sink()),
        })
        .unwrap()
    }

    pub(crate) fn load_program(board: &mut Board, address: u64, program: &[u32]) {
        let bytes: Vec<u8> = program.iter().flat_map(|i| i.to_le_bytes()).collect();
        board.load_physical(address, &bytes).unwrap();
    }

    #[test]
    fn test_power_off_halts_run() {
        let mut board = board();
        // Store 0x5555 to the power controller via x1 = 0x10_0000, x2 = 0x5555.
        load_program(
            &mut board,
            map::RAM_BASE,
            &[
                asm::lui(1, 0x100),      // x1 = 0x10_0000
                asm::lui(2, 0x5),        // x2 = 0x5000
                asm::addi(2, 2, 0x555),  // x2 = 0x5555
                asm::sw(2, 1, 0),
            ],
        );
        assert_eq!(Halt::PowerOff, board.run(100).unwrap());
        // Retired exactly the four instructions.
        assert_eq!(4, board.core().counters().read_minstret());
    }

    #[test]
    fn test_step_budget() {
        let mut board = board();
        // An infinite loop: jal x0, 0.
        load_program(&mut board, map::RAM_BASE, &[asm::jal(0, 0)]);
        assert_eq!(Halt::StepBudgetExhausted, board.run(10).unwrap());
    }

    #[test]
    fn test_mtime_increments_per_instruction() {
        let mut board = board();
        load_program(&mut board, map::RAM_BASE, &[asm::jal(0, 0)]);
        board.run(5).unwrap();
        assert_eq!(5, board.bus().clint().mtime());
    }

    #[test]
    fn test_trap_loop_detected() {
        let mut board = board();
        // mtvec is zero and pc 0 is unmapped, so the first fault can never reach a handler.
        load_program(&mut board, map::RAM_BASE, &[asm::ld(1, 0, 1)]); // misaligned load
        let result = board.run(100);
        assert!(matches!(result, Err(EmulatorError::TrapLoop(_))));
    }

    #[test]
    fn test_trap_stacking_roundtrip() {
        use crate::core::csr;

        let mut board = board();
        // Handler at RAM_BASE + 0x100: advance mepc past the ecall, then return.
        load_program(
            &mut board,
            map::RAM_BASE + 0x100,
            &[
                asm::csrrs(5, csr::MEPC as u32, 0), // x5 = mepc
                asm::addi(5, 5, 4),
                asm::csrrw(0, csr::MEPC as u32, 5),
                asm::mret(),
            ],
        );
        load_program(
            &mut board,
            map::RAM_BASE,
            &[
                asm::li(1, 1),
                asm::slli(1, 1, 31),                 // x1 = 0x8000_0000
                asm::addi(2, 1, 0x100),              // x2 = handler address
                asm::csrrw(0, csr::MTVEC as u32, 2),
                asm::ecall(),
                asm::li(3, 7),                       // reached only if mret resumed correctly
                asm::jal(0, 0),
            ],
        );

        board.run(30).unwrap();
        assert_eq!(7, board.registers().x(crate::registers::Specifier::new(3u8).unwrap()));
        assert_eq!(PrivilegeLevel::Machine, board.privilege_mode());
        let mcause = board
            .core()
            .read_csr(board.bus(), csr::MCAUSE, PrivilegeLevel::Machine)
            .unwrap();
        assert_eq!(11, mcause); // environment call from M-mode
        let mepc = board
            .core()
            .read_csr(board.bus(), csr::MEPC, PrivilegeLevel::Machine)
            .unwrap();
        assert_eq!(map::RAM_BASE + 0x14, mepc);
    }

    #[test]
    fn test_x0_stays_zero() {
        let mut board = board();
        load_program(
            &mut board,
            map::RAM_BASE,
            &[
                asm::addi(0, 0, 42),
                asm::lui(0, 0x12345),
                asm::add(0, 0, 0),
            ],
        );
        board.run(3).unwrap();
        assert_eq!(0, board.registers().x(crate::registers::Specifier::X0));
    }
}
