//! Access interface shared by the interconnect and everything attached to it.

use crate::DataSize;
use thiserror::Error;

/// A memory-mapped agent on the system bus, seen from its *slave* side.
///
/// Accesses are always `(offset, size)` pairs where `offset` is relative to the base of the
/// region the agent is mapped at, and `size` is one of the four natural access sizes. The
/// interconnect guarantees natural alignment before dispatching to a device, so implementations
/// may assume `offset % size == 0` for I/O regions.
///
/// Values travel in host-endian `u64`s holding little-endian guest data in their low
/// `size` bytes; the upper bytes of a read result must be zero.
///
/// Reads may have side effects (e.g. the PLIC claim register, the UART receive buffer).
/// A device that has no register at `offset` should return zero on reads and ignore writes,
/// matching how the real hardware decodes partial register files.
pub trait Device {
    fn read(&mut self, offset: u64, size: DataSize) -> u64;

    fn write(&mut self, offset: u64, size: DataSize, value: u64);

    /// Advance device-internal time by one tick. Most devices have no notion of time.
    fn tick(&mut self) {}

    /// Level of the device's interrupt request line, sampled by the interconnect once per tick.
    fn irq_line(&self) -> bool {
        false
    }
}

/// Faults a bus access can produce. The interpreter maps these to the architectural
/// load/store/fetch exception of the access kind that caused them.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum BusError {
    /// The access does not fall inside any mapped region.
    #[error("access to unmapped guest-physical address {0:#x}")]
    Unmapped(u64),
    /// The address is not naturally aligned for the access size.
    #[error("misaligned {size}-byte access at {address:#x}")]
    Misaligned { address: u64, size: DataSize },
}

impl BusError {
    /// The guest-physical address the fault should report in `mtval`.
    pub fn address(&self) -> u64 {
        match *self {
            BusError::Unmapped(address) => address,
            BusError::Misaligned { address, .. } => address,
        }
    }
}
