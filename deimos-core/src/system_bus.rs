//! The interconnect: routes guest-physical accesses to RAM or a device by address range.

use log::trace;

use crate::bus::{BusError, Device};
use crate::resources::clint::Clint;
use crate::resources::plic::Plic;
use crate::resources::power::Power;
use crate::resources::ram::Ram;
#[cfg(feature = "test-device")]
use crate::resources::test_device::{TestDevice, TEST_DEVICE_IRQ};
use crate::resources::uart::Uart;
use crate::resources::virtio::queue::GuestMemory;
use crate::resources::virtio::VirtioBlock;
use crate::{AddressRange, DataSize};

/// The guest-physical memory map of the board.
pub mod map {
    pub const POWER_BASE: u64 = 0x10_0000;
    pub const POWER_SIZE: u64 = 0x2;

    #[cfg(feature = "test-device")]
    pub const TEST_DEVICE_BASE: u64 = 0x10_1000;
    #[cfg(feature = "test-device")]
    pub const TEST_DEVICE_SIZE: u64 = 0x10;

    pub const CLINT_BASE: u64 = 0x200_0000;
    pub const CLINT_SIZE: u64 = 0x10000;

    pub const PLIC_BASE: u64 = 0xC00_0000;
    pub const PLIC_SIZE: u64 = 0x400_0000;

    pub const UART_BASE: u64 = 0x1000_0000;
    pub const UART_SIZE: u64 = 0x8;

    pub const VIRTIO_BASE: u64 = 0x1000_1000;
    pub const VIRTIO_SIZE: u64 = 0x1000;

    pub const RAM_BASE: u64 = 0x8000_0000;
    pub const RAM_SIZE: u64 = 0x800_0000;
}

/// PLIC source ids of the wired devices.
pub mod irq {
    pub const VIRTIO_IRQ: u32 = 1;
    pub const UART_IRQ: u32 = 10;
}

/// PLIC context indices per (hart, privilege) pair.
pub mod context {
    /// Hart 0, M-mode.
    pub const HART0_M: usize = 0;
    /// Hart 0, S-mode.
    pub const HART0_S: usize = 1;
}

/// Single-master crossbar for the whole guest-physical address space.
///
/// Owns RAM and every device; nothing else in the emulator touches them except through this
/// struct. All mapped ranges are disjoint (see the const assertions below). An access that hits
/// no range, or that is not naturally aligned, is reported as a [`BusError`] for the interpreter
/// to turn into the architectural access/misaligned fault.
///
/// RAM accepts any natural access size; the I/O regions accept the register sizes the device
/// implements and read as zero elsewhere, like real address decoders with partial register
/// files.
#[derive(Debug)]
pub struct SystemBus {
    ram: Ram,
    uart: Uart,
    power: Power,
    clint: Clint,
    plic: Plic,
    virtio: Option<VirtioBlock>,
    #[cfg(feature = "test-device")]
    test_device: Option<TestDevice>,
}

// The map must stay disjoint; these encode the layout assumptions the router below relies on.
const_assert!(map::POWER_BASE + map::POWER_SIZE <= map::CLINT_BASE);
const_assert!(map::CLINT_BASE + map::CLINT_SIZE <= map::PLIC_BASE);
const_assert!(map::PLIC_BASE + map::PLIC_SIZE <= map::UART_BASE);
const_assert!(map::UART_BASE + map::UART_SIZE <= map::VIRTIO_BASE);
const_assert!(map::VIRTIO_BASE + map::VIRTIO_SIZE <= map::RAM_BASE);
#[cfg(feature = "test-device")]
const_assert!(map::POWER_BASE + map::POWER_SIZE <= map::TEST_DEVICE_BASE);
#[cfg(feature = "test-device")]
const_assert!(map::TEST_DEVICE_BASE + map::TEST_DEVICE_SIZE <= map::CLINT_BASE);

impl SystemBus {
    pub fn new(uart: Uart, virtio: Option<VirtioBlock>) -> Self {
        Self {
            ram: Ram::new(map::RAM_SIZE as usize),
            uart,
            power: Power::new(),
            clint: Clint::new(),
            plic: Plic::new(),
            virtio,
            #[cfg(feature = "test-device")]
            test_device: Some(TestDevice::new()),
        }
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    pub fn uart_mut(&mut self) -> &mut Uart {
        &mut self.uart
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn clint(&self) -> &Clint {
        &self.clint
    }

    pub fn plic(&self) -> &Plic {
        &self.plic
    }

    pub fn plic_mut(&mut self) -> &mut Plic {
        &mut self.plic
    }

    /// Advance device time by one tick and collect the device interrupt lines into the PLIC.
    ///
    /// The UART and VirtIO lines are level-sensitive: while high they re-latch their PLIC source
    /// every tick, so a claim followed by a still-pending condition interrupts again. The test
    /// device latches one edge per trigger.
    pub fn tick(&mut self) {
        self.clint.tick();
        if self.uart.irq_line() {
            self.plic.raise(irq::UART_IRQ);
        }
        if self.virtio.as_ref().is_some_and(|v| v.irq_line()) {
            self.plic.raise(irq::VIRTIO_IRQ);
        }
        #[cfg(feature = "test-device")]
        if let Some(device) = &mut self.test_device {
            if device.take_irq() {
                self.plic.raise(TEST_DEVICE_IRQ);
            }
        }
    }

    /// Read a naturally-aligned value of the given size.
    pub fn read(&mut self, address: u64, size: DataSize) -> Result<u64, BusError> {
        self.check_alignment(address, size)?;
        let ram_range = AddressRange::sized(map::RAM_BASE, map::RAM_SIZE).unwrap();
        if ram_range.contains(address) {
            let offset = ram_range.offset_of(address);
            if !self.ram.fits(offset, size.in_bytes() as usize) {
                return Err(BusError::Unmapped(address));
            }
            return Ok(self.ram.read(offset, size));
        }
        self.device_read(address, size)
    }

    /// Write a naturally-aligned value of the given size.
    ///
    /// A store into a device region may trigger device work that completes before this call
    /// returns (e.g. a VirtIO queue notify processes all published requests synchronously).
    pub fn write(&mut self, address: u64, size: DataSize, value: u64) -> Result<(), BusError> {
        self.check_alignment(address, size)?;
        let ram_range = AddressRange::sized(map::RAM_BASE, map::RAM_SIZE).unwrap();
        if ram_range.contains(address) {
            let offset = ram_range.offset_of(address);
            if !self.ram.fits(offset, size.in_bytes() as usize) {
                return Err(BusError::Unmapped(address));
            }
            self.ram.write(offset, size, value);
            return Ok(());
        }
        self.device_write(address, size, value)
    }

    fn check_alignment(&self, address: u64, size: DataSize) -> Result<(), BusError> {
        if size.is_aligned(address) {
            Ok(())
        } else {
            Err(BusError::Misaligned { address, size })
        }
    }

    fn device_read(&mut self, address: u64, size: DataSize) -> Result<u64, BusError> {
        let (device, offset): (&mut dyn Device, u64) = match self.route(address)? {
            Route::Power(offset) => (&mut self.power, offset),
            Route::Clint(offset) => (&mut self.clint, offset),
            Route::Plic(offset) => (&mut self.plic, offset),
            Route::Uart(offset) => (&mut self.uart, offset),
            Route::Virtio(offset) => {
                // Read side never needs guest memory.
                let device = self.virtio.as_mut().ok_or(BusError::Unmapped(address))?;
                return Ok(device.read(offset, size));
            }
            #[cfg(feature = "test-device")]
            Route::TestDevice(offset) => {
                let device = self
                    .test_device
                    .as_mut()
                    .ok_or(BusError::Unmapped(address))?;
                (device, offset)
            }
        };
        Ok(device.read(offset, size))
    }

    fn device_write(&mut self, address: u64, size: DataSize, value: u64) -> Result<(), BusError> {
        trace!("device write {address:#x} <- {value:#x}");
        match self.route(address)? {
            Route::Power(offset) => self.power.write(offset, size, value),
            Route::Clint(offset) => self.clint.write(offset, size, value),
            Route::Plic(offset) => self.plic.write(offset, size, value),
            Route::Uart(offset) => self.uart.write(offset, size, value),
            Route::Virtio(offset) => {
                let device = self.virtio.as_mut().ok_or(BusError::Unmapped(address))?;
                // The device gets a window into RAM for the duration of this store, so a queue
                // notify can walk the rings and move data before the store retires.
                let mut mem = GuestMemory::new(&mut self.ram, map::RAM_BASE);
                device.write(offset, size, value, &mut mem);
            }
            #[cfg(feature = "test-device")]
            Route::TestDevice(offset) => {
                let device = self
                    .test_device
                    .as_mut()
                    .ok_or(BusError::Unmapped(address))?;
                device.write(offset, size, value);
            }
        }
        Ok(())
    }

    fn route(&self, address: u64) -> Result<Route, BusError> {
        let in_region = |base: u64, size: u64| (base..base + size).contains(&address);
        if in_region(map::POWER_BASE, map::POWER_SIZE) {
            return Ok(Route::Power(address - map::POWER_BASE));
        }
        #[cfg(feature = "test-device")]
        if in_region(map::TEST_DEVICE_BASE, map::TEST_DEVICE_SIZE) {
            return Ok(Route::TestDevice(address - map::TEST_DEVICE_BASE));
        }
        if in_region(map::CLINT_BASE, map::CLINT_SIZE) {
            return Ok(Route::Clint(address - map::CLINT_BASE));
        }
        if in_region(map::PLIC_BASE, map::PLIC_SIZE) {
            return Ok(Route::Plic(address - map::PLIC_BASE));
        }
        if in_region(map::UART_BASE, map::UART_SIZE) {
            return Ok(Route::Uart(address - map::UART_BASE));
        }
        if in_region(map::VIRTIO_BASE, map::VIRTIO_SIZE) {
            return Ok(Route::Virtio(address - map::VIRTIO_BASE));
        }
        Err(BusError::Unmapped(address))
    }
}

enum Route {
    Power(u64),
    Clint(u64),
    Plic(u64),
    Uart(u64),
    Virtio(u64),
    #[cfg(feature = "test-device")]
    TestDevice(u64),
}
