//! Whole-board scenarios driven by hand-assembled guest programs: trap causes, timer and
//! external interrupts, UART echo, and block-device round trips.

use std::io::Write;
use std::sync::{Arc, Mutex};

use deimos_core::board::{Board, BoardConfig, Halt};
use deimos_core::core::csr;
use deimos_core::registers::Specifier;
use deimos_core::system_bus::map;
use deimos_core::{DataSize, PrivilegeLevel};

/// Just enough of an RV64I assembler to write the guests below.
mod asm {
    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        (imm as u32) << 20 | rs1 << 15 | rd << 7 | 0x13
    }

    pub fn andi(rd: u32, rs1: u32, imm: i32) -> u32 {
        (imm as u32) << 20 | rs1 << 15 | 0b111 << 12 | rd << 7 | 0x13
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

    pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
        (imm as u32) << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0x03
    }

    pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
        (imm as u32) << 20 | rs1 << 15 | 0b100 << 12 | rd << 7 | 0x03
    }

    fn store(rs2: u32, rs1: u32, imm: i32, funct3: u32) -> u32 {
        let imm = imm as u32;
        (imm >> 5 & 0x7F) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1F) << 7 | 0x23
    }

    pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
        store(rs2, rs1, imm, 0b000)
    }

    pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
        store(rs2, rs1, imm, 0b010)
    }

    pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
        store(rs2, rs1, imm, 0b011)
    }

    fn branch(rs1: u32, rs2: u32, offset: i32, funct3: u32) -> u32 {
        let offset = offset as u32;
        (offset >> 12 & 1) << 31
            | (offset >> 5 & 0x3F) << 25
            | rs2 << 20
            | rs1 << 15
            | funct3 << 12
            | (offset >> 1 & 0xF) << 8
            | (offset >> 11 & 1) << 7
            | 0x63
    }

    pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
        branch(rs1, rs2, offset, 0b000)
    }

    pub fn blt(rs1: u32, rs2: u32, offset: i32) -> u32 {
        branch(rs1, rs2, offset, 0b100)
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

    pub fn csrrsi(rd: u32, csr: u32, uimm: u32) -> u32 {
        csr << 20 | uimm << 15 | 0b110 << 12 | rd << 7 | 0x73
    }

    pub fn mret() -> u32 {
        0x3020_0073
    }

    pub fn li(rd: u32, imm: i32) -> u32 {
        addi(rd, 0, imm)
    }
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn board() -> (Board, SharedSink) {
    let sink = SharedSink::default();
    let board = Board::new(BoardConfig {
        reset_vector: map::RAM_BASE,
        block_image: None,
        uart_output: Box::new(sink.clone()),
    })
    .unwrap();
    (board, sink)
}

fn load(board: &mut Board, address: u64, program: &[u32]) {
    let bytes: Vec<u8> = program.iter().flat_map(|i| i.to_le_bytes()).collect();
    board.load_physical(address, &bytes).unwrap();
}

fn x(board: &Board, index: u8) -> u64 {
    board.registers().x(Specifier::new(index).unwrap())
}

fn read_csr(board: &Board, specifier: u16) -> u64 {
    board
        .core()
        .read_csr(board.bus(), specifier, PrivilegeLevel::Machine)
        .unwrap()
}

const HANDLER: u64 = map::RAM_BASE + 0x200;
const BUFFER: u64 = map::RAM_BASE + 0x1000;

/// `x1 = 0x8000_0000; x2 = handler; mtvec = x2; x7 = buffer`
fn trap_setup_prologue() -> Vec<u32> {
    vec![
        asm::li(1, 1),
        asm::slli(1, 1, 31),
        asm::addi(2, 1, 0x200),
        asm::csrrw(0, csr::MTVEC as u32, 2),
        asm::li(7, 1),
        asm::slli(7, 7, 12),
        asm::add(7, 7, 1),
    ]
}

/// `x9/x10` scratch: store the power-off code to the power controller.
fn power_off_epilogue(scratch1: u32, scratch2: u32) -> Vec<u32> {
    vec![
        asm::lui(scratch1, 0x100),
        asm::lui(scratch2, 0x5),
        asm::addi(scratch2, scratch2, 0x555),
        asm::sw(scratch2, scratch1, 0),
    ]
}

#[test]
fn trap_causes_reported_in_order() {
    let (mut board, _) = board();

    // Handler: append mcause to the buffer, advance mepc past the faulting instruction, return.
    load(
        &mut board,
        HANDLER,
        &[
            asm::csrrs(5, csr::MCAUSE as u32, 0),
            asm::slli(28, 6, 3),
            asm::add(28, 28, 7),
            asm::sd(5, 28, 0),
            asm::addi(6, 6, 1),
            asm::csrrs(5, csr::MEPC as u32, 0),
            asm::addi(5, 5, 4),
            asm::csrrw(0, csr::MEPC as u32, 5),
            asm::mret(),
        ],
    );

    let mut program = trap_setup_prologue();
    program.extend([
        asm::li(6, 0),
        asm::ld(8, 0, 0), // load from unmapped address 0: access fault (5)
        asm::sd(8, 0, 0), // store to unmapped address 0: access fault (7)
        asm::ld(8, 1, 1), // 8-byte load at odd address: misaligned (4)
        asm::sd(8, 1, 1), // 8-byte store at odd address: misaligned (6)
    ]);
    program.extend(power_off_epilogue(9, 10));
    load(&mut board, map::RAM_BASE, &program);

    assert_eq!(Halt::PowerOff, board.run(1000).unwrap());
    assert_eq!(4, x(&board, 6));

    let expected = [5u64, 7, 4, 6];
    for (i, &cause) in expected.iter().enumerate() {
        let mut bytes = [0u8; 8];
        board.peek_ram(BUFFER + 8 * i as u64, &mut bytes).unwrap();
        assert_eq!(cause, u64::from_le_bytes(bytes), "entry {i}");
    }
}

#[test]
fn timer_interrupt_delivered() {
    let (mut board, _) = board();

    // Handler: mask further timer interrupts, record mcause, power off.
    let mut handler = vec![
        asm::csrrw(0, csr::MIE as u32, 0),
        asm::csrrs(5, csr::MCAUSE as u32, 0),
        asm::sd(5, 7, 0),
    ];
    handler.extend(power_off_epilogue(9, 10));
    load(&mut board, HANDLER, &handler);

    let mut program = trap_setup_prologue();
    program.extend([
        asm::lui(3, 0x2000), // CLINT base
        asm::lui(5, 0x4),    // mtimecmp offset
        asm::add(5, 5, 3),
        asm::li(4, 50),
        asm::sd(4, 5, 0), // mtimecmp = 50
        asm::li(4, 1),
        asm::slli(4, 4, 7), // MTIE
        asm::csrrw(0, csr::MIE as u32, 4),
        asm::csrrsi(0, csr::MSTATUS as u32, 8), // MIE
        asm::jal(0, 0),                         // spin until the timer fires
    ]);
    load(&mut board, map::RAM_BASE, &program);

    assert_eq!(Halt::PowerOff, board.run(1000).unwrap());

    let mut bytes = [0u8; 8];
    board.peek_ram(BUFFER, &mut bytes).unwrap();
    // Interrupt flag | machine timer interrupt code.
    assert_eq!(1 << 63 | 7, u64::from_le_bytes(bytes));
    assert!(board.bus().clint().mtime() >= 50);
    // mepc points into the spin loop, which the handler never returned to.
    assert!(read_csr(&board, csr::MEPC) >= map::RAM_BASE);
}

#[cfg(feature = "test-device")]
#[test]
fn external_interrupts_counted_ten_times() {
    let (mut board, _) = board();

    // Handler: claim, complete, bump the counter in x6.
    load(
        &mut board,
        HANDLER,
        &[
            asm::lw(23, 20, 4), // claim
            asm::sw(23, 20, 4), // complete
            asm::addi(6, 6, 1),
            asm::mret(),
        ],
    );

    let mut program = trap_setup_prologue();
    program.extend([
        asm::lui(3, 0xC000), // PLIC base
        asm::li(4, 1),
        asm::sw(4, 3, 252), // priority[63] = 1
        asm::lui(5, 0x2),   // enable array
        asm::add(5, 5, 3),
        asm::lui(4, 0x80000), // low word = 1 << 31
        asm::sw(4, 5, 4),     // enable source 63 for context 0
        asm::lui(8, 0x101),   // test device base
        asm::li(9, 1),
        asm::sw(9, 8, 4), // irq-enable on the test device
        asm::li(4, 1),
        asm::slli(4, 4, 11), // MEIE
        asm::csrrw(0, csr::MIE as u32, 4),
        asm::csrrsi(0, csr::MSTATUS as u32, 8),
        asm::li(10, 0),
        asm::li(11, 10),
        asm::lui(20, 0x200), // context 0 threshold/claim block
        asm::add(20, 20, 3),
        // loop: trigger the device, then count to ten.
        asm::sw(9, 8, 0),
        asm::addi(10, 10, 1),
        asm::blt(10, 11, -8),
    ]);
    program.extend(power_off_epilogue(21, 22));
    load(&mut board, map::RAM_BASE, &program);

    assert_eq!(Halt::PowerOff, board.run(10_000).unwrap());
    assert_eq!(10, x(&board, 6));
}

#[test]
fn uart_echo() {
    let (mut board, sink) = board();

    load(
        &mut board,
        map::RAM_BASE,
        &{
            let mut program = vec![
                asm::lui(1, 0x10000), // UART base
                // poll LSR.DR
                asm::lbu(2, 1, 5),
                asm::andi(2, 2, 1),
                asm::beq(2, 0, -8),
                // echo RBR to THR
                asm::lbu(3, 1, 0),
                asm::sb(3, 1, 0),
            ];
            program.extend(power_off_epilogue(9, 10));
            program
        },
    );

    board.push_uart_input(b'A');
    assert_eq!(Halt::PowerOff, board.run(1000).unwrap());
    assert_eq!(b"A".to_vec(), *sink.0.lock().unwrap());
}

mod virtio_round_trip {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;

    const VIRTIO: u64 = map::VIRTIO_BASE;
    const DESC: u64 = map::RAM_BASE + 0x2000;
    const AVAIL: u64 = map::RAM_BASE + 0x2100;
    const USED: u64 = map::RAM_BASE + 0x2200;
    const HEADER: u64 = map::RAM_BASE + 0x2300;
    const STATUS: u64 = map::RAM_BASE + 0x2310;
    const DATA: u64 = map::RAM_BASE + 0x2400;

    fn scratch_image(sectors: u64) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "deimos-scenario-{}-{sectors}.img",
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0u8; (sectors * 512) as usize]).unwrap();
        path
    }

    fn write32(board: &mut Board, address: u64, value: u32) {
        board
            .bus_mut()
            .write(address, DataSize::Word, value as u64)
            .unwrap();
    }

    fn read32(board: &mut Board, address: u64) -> u32 {
        board.bus_mut().read(address, DataSize::Word).unwrap() as u32
    }

    /// The driver-side initialization sequence, performed through plain bus stores exactly as
    /// guest code would.
    fn init_device(board: &mut Board) {
        write32(board, VIRTIO + 0x70, 0); // reset
        write32(board, VIRTIO + 0x70, 1); // ACKNOWLEDGE
        write32(board, VIRTIO + 0x70, 1 | 2); // +DRIVER
        write32(board, VIRTIO + 0x70, 1 | 2 | 8); // +FEATURES_OK
        write32(board, VIRTIO + 0x30, 0); // queue 0
        write32(board, VIRTIO + 0x38, 8); // queue size
        write32(board, VIRTIO + 0x80, DESC as u32);
        write32(board, VIRTIO + 0x84, (DESC >> 32) as u32);
        write32(board, VIRTIO + 0x90, AVAIL as u32);
        write32(board, VIRTIO + 0x94, (AVAIL >> 32) as u32);
        write32(board, VIRTIO + 0xA0, USED as u32);
        write32(board, VIRTIO + 0xA4, (USED >> 32) as u32);
        write32(board, VIRTIO + 0x44, 1); // queue ready
        write32(board, VIRTIO + 0x70, 1 | 2 | 8 | 4); // +DRIVER_OK
    }

    fn submit(board: &mut Board, request_type: u32, sector: u64, device_writable: bool) {
        // Request header.
        let mut header = Vec::new();
        header.extend_from_slice(&request_type.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&sector.to_le_bytes());
        board.load_physical(HEADER, &header).unwrap();

        // Three-descriptor chain: header, one 512-byte data buffer, status byte.
        let mut table = Vec::new();
        for (addr, len, flags, next) in [
            (HEADER, 16u32, 0x1u16, 1u16), // NEXT
            (DATA, 512, if device_writable { 0x3 } else { 0x1 }, 2),
            (STATUS, 1, 0x2, 0), // WRITE
        ] {
            table.extend_from_slice(&addr.to_le_bytes());
            table.extend_from_slice(&len.to_le_bytes());
            table.extend_from_slice(&flags.to_le_bytes());
            table.extend_from_slice(&next.to_le_bytes());
        }
        board.load_physical(DESC, &table).unwrap();

        // Publish head 0 in the next avail slot.
        let mut idx_bytes = [0u8; 2];
        board.peek_ram(AVAIL + 2, &mut idx_bytes).unwrap();
        let avail_idx = u16::from_le_bytes(idx_bytes);
        board
            .load_physical(AVAIL + 4 + 2 * (avail_idx as u64 % 8), &0u16.to_le_bytes())
            .unwrap();
        board
            .load_physical(AVAIL + 2, &avail_idx.wrapping_add(1).to_le_bytes())
            .unwrap();

        // Ring the doorbell; processing completes inside this store.
        write32(board, VIRTIO + 0x50, 0);
    }

    #[test]
    fn write_then_read_back_bit_identical() {
        let image = scratch_image(4);
        let sink = SharedSink::default();
        let mut board = Board::new(BoardConfig {
            reset_vector: map::RAM_BASE,
            block_image: Some(image.clone()),
            uart_output: Box::new(sink),
        })
        .unwrap();

        assert_eq!(0x7472_6976, read32(&mut board, VIRTIO)); // magic
        assert_eq!(2, read32(&mut board, VIRTIO + 4)); // version
        assert_eq!(2, read32(&mut board, VIRTIO + 8)); // block device
        assert_eq!(4, read32(&mut board, VIRTIO + 0x100)); // capacity in sectors

        init_device(&mut board);

        // Write the pattern i & 0xff into sector 0.
        let pattern: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        board.load_physical(DATA, &pattern).unwrap();
        submit(&mut board, 1, 0, false); // OUT

        let mut status = [0u8; 1];
        board.peek_ram(STATUS, &mut status).unwrap();
        assert_eq!(0, status[0]);

        // Wipe the buffer and read it back.
        board.load_physical(DATA, &vec![0u8; 512]).unwrap();
        submit(&mut board, 0, 0, true); // IN
        board.peek_ram(STATUS, &mut status).unwrap();
        assert_eq!(0, status[0]);

        let mut read_back = vec![0u8; 512];
        board.peek_ram(DATA, &mut read_back).unwrap();
        assert_eq!(pattern, read_back);

        // Two requests retired, used.idx is 2.
        let mut used_idx = [0u8; 2];
        board.peek_ram(USED + 2, &mut used_idx).unwrap();
        assert_eq!(2, u16::from_le_bytes(used_idx));

        // The interrupt line reaches the PLIC once the source is prioritized and enabled.
        write32(&mut board, map::PLIC_BASE + 4, 1); // priority[1] = 1
        write32(&mut board, map::PLIC_BASE + 0x2000, 1 << 1); // enable source 1, context 0
        board.bus_mut().tick();
        assert!(board.bus().plic().irq_line(0));

        std::fs::remove_file(image).unwrap();
    }
}
