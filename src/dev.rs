//! Raw block devices.
//!
//! Every persistent byte in the system lives behind [`BlockDevice`]: the
//! filesystem device carries the inode trees and file data, the swap
//! device carries evicted anonymous pages. Devices transfer whole
//! 512-byte sectors, synchronously. An I/O request outside the device is
//! a kernel bug and panics; there is no error path to thread a bad sector
//! number through.
//!
//! [`MemDisk`] is the reference device: an in-memory sector array used by
//! the test kit and by anything that wants a scratch volume.

use crate::sync::SpinLock;

/// Size of a device sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Index of a sector on a block device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Sector(pub u32);

impl Sector {
    /// The sector index as a `usize`, for indexing host-side arrays.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0 as usize
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Sector;
    fn add(self, rhs: u32) -> Sector {
        Sector(self.0 + rhs)
    }
}

/// A synchronous block device with 512-byte sectors.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn size(&self) -> u32;

    /// Reads `sector` into `buf`.
    ///
    /// # Panics
    /// Panics if `sector` is outside the device. Device-level I/O errors
    /// are fatal.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to `sector`.
    ///
    /// # Panics
    /// Panics if `sector` is outside the device.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]);
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: Vec<SpinLock<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Creates a zero-filled device with `size` sectors.
    pub fn new(size: u32) -> Self {
        let mut sectors = Vec::with_capacity(size as usize);
        sectors.resize_with(size as usize, || SpinLock::new([0; SECTOR_SIZE]));
        MemDisk { sectors }
    }

    fn slot(&self, sector: Sector) -> &SpinLock<[u8; SECTOR_SIZE]> {
        self.sectors
            .get(sector.into_usize())
            .unwrap_or_else(|| panic!("sector {:?} out of range", sector))
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u32 {
        self.sectors.len() as u32
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&*self.slot(sector).lock());
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        self.slot(sector).lock().copy_from_slice(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let disk = MemDisk::new(16);
        let mut block = [0u8; SECTOR_SIZE];
        block[0] = 0xaa;
        block[SECTOR_SIZE - 1] = 0x55;
        disk.write(Sector(3), &block);

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(3), &mut out);
        assert_eq!(block, out);

        disk.read(Sector(4), &mut out);
        assert_eq!(out, [0u8; SECTOR_SIZE]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_is_fatal() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(Sector(4), &mut buf);
    }
}
