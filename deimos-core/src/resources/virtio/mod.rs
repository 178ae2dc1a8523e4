//! VirtIO-MMIO block device (device side of the split-virtqueue transport).
//!
//! Non-legacy (Version 2) register interface only. The device advertises the minimal feature
//! set (`VIRTIO_F_VERSION_1`); driver-written feature bits are accepted as a no-op.

pub mod block;
pub mod queue;

use bitflags::bitflags;
use log::{debug, error, warn};
use thiserror::Error;

use crate::DataSize;
use block::{BlockBackend, SECTOR_SIZE};
use queue::{Descriptor, GuestMemory, QueueError, VirtQueue};

pub const MAGIC: u32 = 0x7472_6976; // "virt"
pub const VERSION: u32 = 2;
pub const DEVICE_ID_BLOCK: u32 = 2;
pub const VENDOR_ID: u32 = 0x1AF4;
pub const QUEUE_NUM_MAX: u32 = 8;

/// Device feature bits. Only the bare minimum is advertised.
pub const FEATURE_VERSION_1: u64 = 1 << 32;

/// Register offsets of the VirtIO-MMIO transport (all 32-bit, little-endian).
mod offset {
    pub const MAGIC_VALUE: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00C;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x020;
    pub const DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const QUEUE_SEL: u64 = 0x030;
    pub const QUEUE_NUM_MAX: u64 = 0x034;
    pub const QUEUE_NUM: u64 = 0x038;
    pub const QUEUE_READY: u64 = 0x044;
    pub const QUEUE_NOTIFY: u64 = 0x050;
    pub const INTERRUPT_STATUS: u64 = 0x060;
    pub const INTERRUPT_ACK: u64 = 0x064;
    pub const STATUS: u64 = 0x070;
    pub const QUEUE_DESC_LOW: u64 = 0x080;
    pub const QUEUE_DESC_HIGH: u64 = 0x084;
    pub const QUEUE_AVAIL_LOW: u64 = 0x090;
    pub const QUEUE_AVAIL_HIGH: u64 = 0x094;
    pub const QUEUE_USED_LOW: u64 = 0x0A0;
    pub const QUEUE_USED_HIGH: u64 = 0x0A4;
    pub const CONFIG_GENERATION: u64 = 0x0FC;
    pub const CONFIG: u64 = 0x100;
    pub const CONFIG_HIGH: u64 = CONFIG + 4;
}

bitflags! {
    /// The device status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        /// Driver acknowledges that it has seen the device.
        const ACKNOWLEDGE = 1 << 0;
        /// Driver has found a usable device driver.
        const DRIVER = 1 << 1;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 1 << 2;
        /// Driver has accepted the negotiated features.
        const FEATURES_OK = 1 << 3;
        /// Device has experienced an unrecoverable error.
        const NEEDS_RESET = 1 << 6;
        /// Driver has given up on the device, or the device saw an illegal request.
        const FAILED = 1 << 7;
    }
}

/// Interrupt-status bit: the device has used a buffer.
const ISR_USED_BUFFER: u32 = 1 << 0;

#[derive(Error, Debug)]
enum RequestError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("request chain lacks a header or status descriptor")]
    MalformedChain,
}

/// Device side of a VirtIO-MMIO block device with a single request queue.
///
/// Guest memory is only touched through the [`GuestMemory`] port passed into
/// [`write`](Self::write), so the transport never holds a reference into RAM.
#[derive(Debug)]
pub struct VirtioBlock {
    backend: BlockBackend,
    status: DeviceStatus,
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    queue: VirtQueue,
    isr: u32,
    irq: bool,
}

impl VirtioBlock {
    pub fn new(backend: BlockBackend) -> Self {
        Self {
            backend,
            status: DeviceStatus::empty(),
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queue: VirtQueue::default(),
            isr: 0,
            irq: false,
        }
    }

    /// Level of the interrupt line into the PLIC.
    pub fn irq_line(&self) -> bool {
        self.irq
    }

    /// Writing 0 to the status register resets the device to its initial state.
    /// The backing image is unaffected.
    fn reset(&mut self) {
        debug!("virtio-blk: device reset");
        self.status = DeviceStatus::empty();
        self.device_features_sel = 0;
        self.driver_features = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.queue = VirtQueue::default();
        self.isr = 0;
        self.irq = false;
    }

    /// Mark the device as failed; the queue stays dead until the driver resets the device.
    fn fail(&mut self, reason: &dyn std::fmt::Display) {
        error!("virtio-blk: device failed: {reason}");
        self.status |= DeviceStatus::FAILED;
    }

    pub fn read(&mut self, offset: u64, _size: DataSize) -> u64 {
        let value = match offset {
            offset::MAGIC_VALUE => MAGIC,
            offset::VERSION => VERSION,
            offset::DEVICE_ID => DEVICE_ID_BLOCK,
            offset::VENDOR_ID => VENDOR_ID,
            offset::DEVICE_FEATURES => {
                (FEATURE_VERSION_1 >> (32 * (self.device_features_sel & 1))) as u32
            }
            offset::QUEUE_NUM_MAX => QUEUE_NUM_MAX,
            offset::QUEUE_READY => self.queue.ready as u32,
            offset::INTERRUPT_STATUS => self.isr,
            offset::STATUS => self.status.bits(),
            offset::CONFIG_GENERATION => 0,
            // Device-specific config: capacity in 512-byte sectors, u64 little-endian.
            offset::CONFIG => self.backend.capacity_sectors() as u32,
            offset::CONFIG_HIGH => (self.backend.capacity_sectors() >> 32) as u32,
            _ => 0,
        };
        value as u64
    }

    pub fn write(&mut self, offset: u64, _size: DataSize, value: u64, mem: &mut GuestMemory) {
        let value = value as u32;
        match offset {
            offset::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            offset::DRIVER_FEATURES => {
                // Accepted as a no-op; the device works the same with every subset.
                let shift = 32 * (self.driver_features_sel & 1);
                self.driver_features =
                    self.driver_features & !(0xFFFF_FFFF << shift) | (value as u64) << shift;
            }
            offset::DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            offset::QUEUE_SEL => self.queue_sel = value,
            offset::QUEUE_NUM => {
                if self.queue_sel != 0 {
                    return;
                }
                if value.is_power_of_two() && value <= QUEUE_NUM_MAX {
                    self.queue.num = value;
                } else {
                    warn!("virtio-blk: ignoring invalid queue size {value}");
                }
            }
            offset::QUEUE_READY => {
                if self.queue_sel == 0 {
                    self.queue.ready = value & 1 != 0;
                }
            }
            offset::QUEUE_NOTIFY => {
                if value == 0 {
                    self.process_queue(mem);
                }
            }
            offset::INTERRUPT_ACK => {
                self.isr &= !value;
                if self.isr == 0 {
                    self.irq = false;
                }
            }
            offset::STATUS => self.write_status(value),
            offset::QUEUE_DESC_LOW => self.set_low(|q| &mut q.desc_addr, value),
            offset::QUEUE_DESC_HIGH => self.set_high(|q| &mut q.desc_addr, value),
            offset::QUEUE_AVAIL_LOW => self.set_low(|q| &mut q.avail_addr, value),
            offset::QUEUE_AVAIL_HIGH => self.set_high(|q| &mut q.avail_addr, value),
            offset::QUEUE_USED_LOW => self.set_low(|q| &mut q.used_addr, value),
            offset::QUEUE_USED_HIGH => self.set_high(|q| &mut q.used_addr, value),
            offset::MAGIC_VALUE
            | offset::VERSION
            | offset::DEVICE_ID
            | offset::VENDOR_ID
            | offset::DEVICE_FEATURES
            | offset::QUEUE_NUM_MAX
            | offset::INTERRUPT_STATUS
            | offset::CONFIG_GENERATION => {
                warn!("virtio-blk: write to read-only register {offset:#x}");
            }
            _ => {}
        }
    }

    fn set_low(&mut self, field: impl FnOnce(&mut VirtQueue) -> &mut u64, value: u32) {
        if self.queue_sel == 0 {
            let field = field(&mut self.queue);
            *field = *field & !0xFFFF_FFFF | value as u64;
        }
    }

    fn set_high(&mut self, field: impl FnOnce(&mut VirtQueue) -> &mut u64, value: u32) {
        if self.queue_sel == 0 {
            let field = field(&mut self.queue);
            *field = *field & 0xFFFF_FFFF | (value as u64) << 32;
        }
    }

    /// Enforces the status state machine:
    /// `{0} → ACKNOWLEDGE → +DRIVER → +FEATURES_OK → +DRIVER_OK`.
    /// Writing 0 resets the device; any other illegal transition sets FAILED.
    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.reset();
            return;
        }
        let new = DeviceStatus::from_bits_truncate(value);
        let setup_bits = DeviceStatus::ACKNOWLEDGE
            | DeviceStatus::DRIVER
            | DeviceStatus::FEATURES_OK
            | DeviceStatus::DRIVER_OK;
        // Setup bits can only be added, never dropped without a full reset.
        if !new.contains(self.status & setup_bits) {
            self.fail(&"status write drops previously set bits");
            return;
        }
        // Each stage requires the previous one.
        let stages = [
            (DeviceStatus::DRIVER, DeviceStatus::ACKNOWLEDGE),
            (DeviceStatus::FEATURES_OK, DeviceStatus::DRIVER),
            (DeviceStatus::DRIVER_OK, DeviceStatus::FEATURES_OK),
        ];
        for (stage, prerequisite) in stages {
            if new.contains(stage) && !new.contains(prerequisite) {
                self.fail(&format!("status {new:?} skips the {prerequisite:?} stage"));
                return;
            }
        }
        if new.contains(DeviceStatus::FEATURES_OK) && !self.status.contains(DeviceStatus::FEATURES_OK)
        {
            debug!(
                "virtio-blk: driver accepted features {:#x}",
                self.driver_features
            );
        }
        self.status = new | (self.status & DeviceStatus::FAILED);
    }

    /// Drain all driver-published request chains from the queue.
    ///
    /// Runs synchronously inside the QueueNotify store that triggered it; the used-ring
    /// publication is observable to the very next guest load.
    fn process_queue(&mut self, mem: &mut GuestMemory) {
        if !self.queue.ready
            || !self.status.contains(DeviceStatus::DRIVER_OK)
            || self.status.contains(DeviceStatus::FAILED)
        {
            return;
        }
        let mut retired = false;
        loop {
            let head = match self.queue.pop_avail(mem) {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            };
            match self.handle_request(mem, head) {
                Ok(written) => {
                    if let Err(err) = self.queue.push_used(mem, head, written) {
                        self.fail(&err);
                        return;
                    }
                    retired = true;
                }
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }
        if retired {
            self.isr |= ISR_USED_BUFFER;
            let suppressed = self.queue.notification_suppressed(mem).unwrap_or(false);
            if !suppressed {
                self.irq = true;
            }
        }
    }

    /// Execute one request chain. Returns the number of bytes written back to device-writable
    /// buffers (for the used-ring element).
    ///
    /// Backend and DMA failures inside the data phase are reported in-band through the status
    /// byte; only a malformed chain (which leaves no place to report) is an error.
    fn handle_request(&mut self, mem: &mut GuestMemory, head: u16) -> Result<u32, RequestError> {
        let chain = self.queue.collect_chain(mem, head)?;
        // A well-formed request is at least a read-only header plus a writable status byte.
        let [header, data @ .., status_descriptor] = chain.as_slice() else {
            return Err(RequestError::MalformedChain);
        };
        if header.device_writable() || header.len < 16 || !status_descriptor.device_writable() {
            return Err(RequestError::MalformedChain);
        }

        let request_type = mem.read_u32(header.addr)?;
        let sector = mem.read_u64(header.addr + 8)?;

        let (status, data_written) = self.dispatch(mem, request_type, sector, data);
        mem.write_u8(status_descriptor.addr, status)?;
        Ok(data_written + 1)
    }

    /// Run the data phase of a request, returning the status byte and the number of data bytes
    /// written to guest memory.
    fn dispatch(
        &mut self,
        mem: &mut GuestMemory,
        request_type: u32,
        sector: u64,
        data: &[Descriptor],
    ) -> (u8, u32) {
        let total_len: u64 = data.iter().map(|d| d.len as u64).sum();
        match request_type {
            block::REQUEST_IN | block::REQUEST_OUT if total_len % SECTOR_SIZE != 0 => {
                warn!("virtio-blk: data length {total_len} is not sector-aligned");
                (block::STATUS_IOERR, 0)
            }
            block::REQUEST_IN => {
                // Read the whole range once, then scatter it over the (possibly odd-sized)
                // data descriptors.
                if data.iter().any(|d| !d.device_writable()) {
                    return (block::STATUS_IOERR, 0);
                }
                let mut buf = vec![0u8; total_len as usize];
                if self.backend.read_sectors(sector, &mut buf).is_err() {
                    return (block::STATUS_IOERR, 0);
                }
                let mut written = 0u32;
                for descriptor in data {
                    let part = &buf[written as usize..][..descriptor.len as usize];
                    if mem.write_from(descriptor.addr, part).is_err() {
                        return (block::STATUS_IOERR, written);
                    }
                    written += descriptor.len;
                }
                (block::STATUS_OK, written)
            }
            block::REQUEST_OUT => {
                // Gather the descriptors into one buffer, then write it in a single pass.
                if data.iter().any(|d| d.device_writable()) {
                    return (block::STATUS_IOERR, 0);
                }
                let mut buf = vec![0u8; total_len as usize];
                let mut gathered = 0usize;
                for descriptor in data {
                    let part = &mut buf[gathered..][..descriptor.len as usize];
                    if mem.read_into(descriptor.addr, part).is_err() {
                        return (block::STATUS_IOERR, 0);
                    }
                    gathered += descriptor.len as usize;
                }
                if self.backend.write_sectors(sector, &buf).is_err() {
                    return (block::STATUS_IOERR, 0);
                }
                (block::STATUS_OK, 0)
            }
            block::REQUEST_FLUSH => match self.backend.flush() {
                Ok(()) => (block::STATUS_OK, 0),
                Err(_) => (block::STATUS_IOERR, 0),
            },
            block::REQUEST_GET_ID => {
                let id = self.backend.device_id();
                match data {
                    [descriptor] if descriptor.device_writable() => {
                        let len = (descriptor.len as usize).min(id.len());
                        match mem.write_from(descriptor.addr, &id[..len]) {
                            Ok(()) => (block::STATUS_OK, len as u32),
                            Err(_) => (block::STATUS_IOERR, 0),
                        }
                    }
                    _ => (block::STATUS_IOERR, 0),
                }
            }
            other => {
                warn!("virtio-blk: unsupported request type {other}");
                (block::STATUS_UNSUPPORTED, 0)
            }
        }
    }
}
