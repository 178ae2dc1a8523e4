//! Implementation of a UART16550A subset as a simulatable device.
//!
//! Resources:
//! - <https://uart16550.readthedocs.io>
//! - <https://github.com/qemu/qemu/blob/master/hw/char/serial.c>

use std::collections::VecDeque;
use std::io::Write;

use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::warn;

use crate::bus::Device;
use crate::DataSize;

/// Register offsets (byte-wide registers, one per address).
mod offset {
    /// Receiver Buffer Register (read) / Transmitter Holding Register (write).
    pub const RBR_THR: u64 = 0;
    /// Interrupt Enable Register.
    pub const IER: u64 = 1;
    /// Line Status Register.
    pub const LSR: u64 = 5;
}

/// Byte-level transmit/receive with LSR status bits; no FIFOs, divisor latch, or modem lines.
///
/// Transmission is instantaneous: a byte written to THR goes straight into the host output
/// sink, so THRE and TEMT are always set. The receive side is backed by a queue the host side
/// fills through [`Uart::push_input`]; DR tracks whether that queue is non-empty.
///
/// The interrupt line is high while received data is available and the RX-available interrupt
/// is enabled through IER bit 0.
pub struct Uart {
    output: Box<dyn Write>,
    input: VecDeque<u8>,
    ier: u8,
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart")
            .field("input", &self.input)
            .field("ier", &self.ier)
            .finish_non_exhaustive()
    }
}

impl Uart {
    pub fn new(output: Box<dyn Write>) -> Self {
        Self {
            output,
            input: VecDeque::new(),
            ier: 0,
        }
    }

    /// Queue a byte on the receive side, as if it arrived over the serial line.
    pub fn push_input(&mut self, byte: u8) {
        self.input.push_back(byte);
    }

    fn lsr(&self) -> u8 {
        let mut lsr = 0u8;
        let bits = lsr.view_bits_mut::<Lsb0>();
        // DR: data ready
        bits.set(0, !self.input.is_empty());
        // THRE + TEMT: the transmitter never holds anything back
        bits.set(5, true);
        bits.set(6, true);
        lsr
    }
}

impl Device for Uart {
    fn read(&mut self, offset: u64, _size: DataSize) -> u64 {
        match offset {
            offset::RBR_THR => self.input.pop_front().unwrap_or(0) as u64,
            offset::IER => self.ier as u64,
            offset::LSR => self.lsr() as u64,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, _size: DataSize, value: u64) {
        match offset {
            offset::RBR_THR => {
                let byte = value as u8;
                if self.output.write_all(&[byte]).is_err() {
                    warn!("dropping UART output byte {byte:#04x}: sink write failed");
                }
                let _ = self.output.flush();
            }
            offset::IER => self.ier = value as u8,
            _ => {}
        }
    }

    fn irq_line(&self) -> bool {
        self.ier & 0x01 != 0 && !self.input.is_empty()
    }
}
