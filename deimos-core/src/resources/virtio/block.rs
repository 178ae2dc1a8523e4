//! Block backend: sector I/O against a raw image file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Unit of block I/O.
pub const SECTOR_SIZE: u64 = 512;

/// Request types of the virtio block protocol.
pub const REQUEST_IN: u32 = 0;
pub const REQUEST_OUT: u32 = 1;
pub const REQUEST_FLUSH: u32 = 4;
pub const REQUEST_GET_ID: u32 = 8;

/// Request status byte values.
pub const STATUS_OK: u8 = 0;
pub const STATUS_IOERR: u8 = 1;
pub const STATUS_UNSUPPORTED: u8 = 2;

/// Length of the device-id string returned by GET_ID requests.
pub const DEVICE_ID_LEN: usize = 20;

/// Owns the raw backing image for the lifetime of the device.
///
/// The image length determines the capacity in 512-byte sectors; a trailing partial sector is
/// not addressable.
#[derive(Debug)]
pub struct BlockBackend {
    file: File,
    capacity_sectors: u64,
}

impl BlockBackend {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity_sectors = file.metadata()?.len() / SECTOR_SIZE;
        Ok(Self {
            file,
            capacity_sectors,
        })
    }

    /// Capacity in 512-byte sectors, as exposed through the device config space.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn check_range(&self, sector: u64, len: usize) -> io::Result<()> {
        let sectors = len as u64 / SECTOR_SIZE;
        if sector.checked_add(sectors).is_some_and(|end| end <= self.capacity_sectors) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sector range beyond image capacity",
            ))
        }
    }

    /// Read `buf.len()` bytes starting at `sector`. `buf.len()` must be a multiple of the
    /// sector size.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(sector, buf.len())?;
        self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
        self.file.read_exact(buf)
    }

    /// Write `buf.len()` bytes starting at `sector`. `buf.len()` must be a multiple of the
    /// sector size.
    pub fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        self.check_range(sector, buf.len())?;
        self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
        self.file.write_all(buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Identity string answered to GET_ID requests, zero-padded to 20 bytes.
    pub fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        let mut id = [0u8; DEVICE_ID_LEN];
        let name = b"deimos-blk";
        id[..name.len()].copy_from_slice(name);
        id
    }
}
