//! Device-side view of a split virtqueue.

use bitflags::bitflags;
use thiserror::Error;

use crate::resources::ram::Ram;
use crate::DataSize;

/// Size of a descriptor table entry in guest memory.
pub const DESCRIPTOR_SIZE: u64 = 16;

bitflags! {
    /// Flags of a virtqueue descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u16 {
        /// The `next` field points at another descriptor of the same request.
        const NEXT = 1;
        /// The buffer is device-writable (otherwise it is device-readable).
        const WRITE = 2;
        /// The buffer holds a table of indirect descriptors.
        const INDIRECT = 4;
    }
}

/// One entry of the descriptor table, as read from guest memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescriptorFlags,
    pub next: u16,
}

impl Descriptor {
    pub fn device_writable(&self) -> bool {
        self.flags.contains(DescriptorFlags::WRITE)
    }
}

/// Errors the device can hit while walking driver-published rings.
///
/// [`BadAddress`](QueueError::BadAddress) during buffer I/O is recoverable (the request is
/// retired with an I/O error status); the other variants poison the queue until reset.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum QueueError {
    #[error("guest address {0:#x} is not backed by RAM")]
    BadAddress(u64),
    #[error("descriptor index {0} out of range for queue of size {1}")]
    BadDescriptorIndex(u16, u32),
    #[error("descriptor chain longer than the queue size (cycle?)")]
    ChainTooLong,
}

/// Access port into guest RAM for device-initiated (DMA) traffic.
///
/// Devices never touch the RAM resource directly; the interconnect hands them this window for
/// the duration of one register access. Addresses are guest-physical; anything outside the RAM
/// region yields [`QueueError::BadAddress`], never a wild access.
#[derive(Debug)]
pub struct GuestMemory<'a> {
    ram: &'a mut Ram,
    ram_base: u64,
}

impl<'a> GuestMemory<'a> {
    pub fn new(ram: &'a mut Ram, ram_base: u64) -> Self {
        Self { ram, ram_base }
    }

    fn offset(&self, address: u64, len: usize) -> Result<u64, QueueError> {
        let offset = address
            .checked_sub(self.ram_base)
            .ok_or(QueueError::BadAddress(address))?;
        if self.ram.fits(offset, len) {
            Ok(offset)
        } else {
            Err(QueueError::BadAddress(address))
        }
    }

    pub fn read_u16(&self, address: u64) -> Result<u16, QueueError> {
        let offset = self.offset(address, 2)?;
        Ok(self.ram.read(offset, DataSize::Halfword) as u16)
    }

    pub fn write_u16(&mut self, address: u64, value: u16) -> Result<(), QueueError> {
        let offset = self.offset(address, 2)?;
        self.ram.write(offset, DataSize::Halfword, value as u64);
        Ok(())
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, QueueError> {
        let offset = self.offset(address, 4)?;
        Ok(self.ram.read(offset, DataSize::Word) as u32)
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<(), QueueError> {
        let offset = self.offset(address, 4)?;
        self.ram.write(offset, DataSize::Word, value as u64);
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, QueueError> {
        let offset = self.offset(address, 8)?;
        Ok(self.ram.read(offset, DataSize::Doubleword))
    }

    pub fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), QueueError> {
        let offset = self.offset(address, buf.len())?;
        self.ram.read_bytes(offset, buf);
        Ok(())
    }

    pub fn write_from(&mut self, address: u64, buf: &[u8]) -> Result<(), QueueError> {
        let offset = self.offset(address, buf.len())?;
        self.ram.write_bytes(offset, buf);
        Ok(())
    }

    pub fn write_u8(&mut self, address: u64, value: u8) -> Result<(), QueueError> {
        let offset = self.offset(address, 1)?;
        self.ram.write(offset, DataSize::Byte, value as u64);
        Ok(())
    }
}

/// Device-side state of one split virtqueue.
///
/// The three ring addresses and the size are driver-programmed through the transport;
/// `last_avail_idx` tracks the next driver-published slot the device will consume and is
/// strictly monotonic modulo 2^16.
#[derive(Debug, Clone, Default)]
pub struct VirtQueue {
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    pub num: u32,
    pub ready: bool,
    pub last_avail_idx: u16,
}

impl VirtQueue {
    /// Read the driver-owned `avail.idx`.
    pub fn avail_idx(&self, mem: &GuestMemory) -> Result<u16, QueueError> {
        mem.read_u16(self.avail_addr + 2)
    }

    /// Pop the next driver-published descriptor chain head, if any.
    ///
    /// Guest stores to the rings happen-before the queue notify that triggers this read, so a
    /// non-equal index here guarantees the head entry is valid.
    pub fn pop_avail(&mut self, mem: &GuestMemory) -> Result<Option<u16>, QueueError> {
        if self.avail_idx(mem)? == self.last_avail_idx {
            return Ok(None);
        }
        let slot = (self.last_avail_idx as u32 % self.num) as u64;
        let head = mem.read_u16(self.avail_addr + 4 + 2 * slot)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    fn descriptor_at(&self, mem: &GuestMemory, table: u64, index: u16, table_len: u32) -> Result<Descriptor, QueueError> {
        if index as u32 >= table_len {
            return Err(QueueError::BadDescriptorIndex(index, table_len));
        }
        let base = table + DESCRIPTOR_SIZE * index as u64;
        Ok(Descriptor {
            addr: mem.read_u64(base)?,
            len: mem.read_u32(base + 8)?,
            flags: DescriptorFlags::from_bits_truncate(mem.read_u16(base + 12)?),
            next: mem.read_u16(base + 14)?,
        })
    }

    /// Walk the descriptor chain starting at `head`, following `next` while the NEXT flag is
    /// set. An INDIRECT descriptor substitutes its referenced table for the remainder of the
    /// chain. The total chain length is bounded by the queue size to rule out cycles.
    pub fn collect_chain(
        &self,
        mem: &GuestMemory,
        head: u16,
    ) -> Result<Vec<Descriptor>, QueueError> {
        let mut chain = Vec::new();
        // (table base, table length, current index)
        let mut table = (self.desc_addr, self.num, head);
        loop {
            let descriptor = self.descriptor_at(mem, table.0, table.2, table.1)?;
            if descriptor.flags.contains(DescriptorFlags::INDIRECT) {
                // The indirect table replaces the rest of the chain.
                table = (descriptor.addr, descriptor.len / DESCRIPTOR_SIZE as u32, 0);
                continue;
            }
            let has_next = descriptor.flags.contains(DescriptorFlags::NEXT);
            let next = descriptor.next;
            chain.push(descriptor);
            if chain.len() as u32 > self.num {
                return Err(QueueError::ChainTooLong);
            }
            if !has_next {
                return Ok(chain);
            }
            table.2 = next;
        }
    }

    /// Append a used-ring element and publish it by incrementing `used.idx`.
    ///
    /// The element is written before the index, which is the release-ordering the driver relies
    /// on: a guest that observes the incremented index is guaranteed to see the data. (In this
    /// single-threaded emulator program order is sufficient.)
    pub fn push_used(&mut self, mem: &mut GuestMemory, head: u16, len: u32) -> Result<(), QueueError> {
        let used_idx = mem.read_u16(self.used_addr + 2)?;
        let slot = (used_idx as u32 % self.num) as u64;
        let element = self.used_addr + 4 + 8 * slot;
        mem.write_u32(element, head as u32)?;
        mem.write_u32(element + 4, len)?;
        mem.write_u16(self.used_addr + 2, used_idx.wrapping_add(1))?;
        Ok(())
    }

    /// Returns `true` if the flags word of the used ring forbids notifying the driver.
    pub fn notification_suppressed(&self, mem: &GuestMemory) -> Result<bool, QueueError> {
        Ok(mem.read_u16(self.used_addr)? & 1 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM_BASE: u64 = 0x8000_0000;
    const DESC: u64 = RAM_BASE + 0x100;
    const AVAIL: u64 = RAM_BASE + 0x200;
    const USED: u64 = RAM_BASE + 0x300;

    fn queue() -> VirtQueue {
        VirtQueue {
            desc_addr: DESC,
            avail_addr: AVAIL,
            used_addr: USED,
            num: 8,
            ready: true,
            last_avail_idx: 0,
        }
    }

    fn write_descriptor(mem: &mut GuestMemory, table: u64, index: u16, descriptor: Descriptor) {
        let base = table + DESCRIPTOR_SIZE * index as u64;
        let addr_bytes = descriptor.addr.to_le_bytes();
        mem.write_from(base, &addr_bytes).unwrap();
        mem.write_u32(base + 8, descriptor.len).unwrap();
        mem.write_u16(base + 12, descriptor.flags.bits()).unwrap();
        mem.write_u16(base + 14, descriptor.next).unwrap();
    }

    fn publish_avail(mem: &mut GuestMemory, slot: u16, head: u16, new_idx: u16) {
        mem.write_u16(AVAIL + 4 + 2 * slot as u64, head).unwrap();
        mem.write_u16(AVAIL + 2, new_idx).unwrap();
    }

    #[test]
    fn test_pop_avail_in_order() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let mut queue = queue();

        assert_eq!(None, queue.pop_avail(&mem).unwrap());
        publish_avail(&mut mem, 0, 3, 1);
        publish_avail(&mut mem, 1, 5, 2);
        assert_eq!(Some(3), queue.pop_avail(&mem).unwrap());
        assert_eq!(Some(5), queue.pop_avail(&mem).unwrap());
        assert_eq!(None, queue.pop_avail(&mem).unwrap());
        assert_eq!(2, queue.last_avail_idx);
    }

    #[test]
    fn test_collect_chain() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let queue = queue();

        write_descriptor(
            &mut mem,
            DESC,
            0,
            Descriptor {
                addr: RAM_BASE + 0x400,
                len: 16,
                flags: DescriptorFlags::NEXT,
                next: 2,
            },
        );
        write_descriptor(
            &mut mem,
            DESC,
            2,
            Descriptor {
                addr: RAM_BASE + 0x500,
                len: 512,
                flags: DescriptorFlags::NEXT | DescriptorFlags::WRITE,
                next: 4,
            },
        );
        write_descriptor(
            &mut mem,
            DESC,
            4,
            Descriptor {
                addr: RAM_BASE + 0x600,
                len: 1,
                flags: DescriptorFlags::WRITE,
                next: 0,
            },
        );

        let chain = queue.collect_chain(&mem, 0).unwrap();
        assert_eq!(3, chain.len());
        assert!(!chain[0].device_writable());
        assert!(chain[1].device_writable());
        assert_eq!(1, chain[2].len);
    }

    #[test]
    fn test_chain_cycle_detected() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let queue = queue();

        // 0 -> 1 -> 0 -> ...
        write_descriptor(
            &mut mem,
            DESC,
            0,
            Descriptor {
                addr: RAM_BASE + 0x400,
                len: 4,
                flags: DescriptorFlags::NEXT,
                next: 1,
            },
        );
        write_descriptor(
            &mut mem,
            DESC,
            1,
            Descriptor {
                addr: RAM_BASE + 0x400,
                len: 4,
                flags: DescriptorFlags::NEXT,
                next: 0,
            },
        );
        assert_eq!(
            Err(QueueError::ChainTooLong),
            queue.collect_chain(&mem, 0)
        );
    }

    #[test]
    fn test_out_of_range_descriptor_rejected() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let queue = queue();
        assert_eq!(
            Err(QueueError::BadDescriptorIndex(12, 8)),
            queue.collect_chain(&mem, 12)
        );
    }

    #[test]
    fn test_indirect_chain() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let queue = queue();

        let indirect_table = RAM_BASE + 0x800;
        write_descriptor(
            &mut mem,
            DESC,
            0,
            Descriptor {
                addr: indirect_table,
                len: 2 * DESCRIPTOR_SIZE as u32,
                flags: DescriptorFlags::INDIRECT,
                next: 0,
            },
        );
        write_descriptor(
            &mut mem,
            indirect_table,
            0,
            Descriptor {
                addr: RAM_BASE + 0x400,
                len: 16,
                flags: DescriptorFlags::NEXT,
                next: 1,
            },
        );
        write_descriptor(
            &mut mem,
            indirect_table,
            1,
            Descriptor {
                addr: RAM_BASE + 0x500,
                len: 1,
                flags: DescriptorFlags::WRITE,
                next: 0,
            },
        );

        let chain = queue.collect_chain(&mem, 0).unwrap();
        assert_eq!(2, chain.len());
        assert_eq!(16, chain[0].len);
        assert_eq!(RAM_BASE + 0x500, chain[1].addr);
    }

    #[test]
    fn test_push_used_publishes_in_order() {
        let mut ram = Ram::new(0x1000);
        let mut mem = GuestMemory::new(&mut ram, RAM_BASE);
        let mut queue = queue();

        queue.push_used(&mut mem, 3, 513).unwrap();
        assert_eq!(1, mem.read_u16(USED + 2).unwrap());
        assert_eq!(3, mem.read_u32(USED + 4).unwrap());
        assert_eq!(513, mem.read_u32(USED + 8).unwrap());

        queue.push_used(&mut mem, 6, 1).unwrap();
        assert_eq!(2, mem.read_u16(USED + 2).unwrap());
        assert_eq!(6, mem.read_u32(USED + 4 + 8).unwrap());
    }

    #[test]
    fn test_dma_bounds() {
        let mut ram = Ram::new(0x1000);
        let mem = GuestMemory::new(&mut ram, RAM_BASE);
        assert_eq!(
            Err(QueueError::BadAddress(0x1000)),
            mem.read_u16(0x1000)
        );
        assert_eq!(
            Err(QueueError::BadAddress(RAM_BASE + 0x1000)),
            mem.read_u16(RAM_BASE + 0x1000)
        );
    }
}
