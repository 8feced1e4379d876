//! Block devices
//!
//! The kernel sees sector-addressed block devices. Here they are
//! RAM-backed; the paging device and every filesystem volume is one of
//! these, shared behind a lock because the page file and a mounted
//! filesystem may sit on the same disk.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};

/// A sector-addressed RAM disk.
#[derive(Debug)]
pub struct RamDisk {
    name: String,
    data: Vec<u8>,
    /// Sector read count, for the sys-info dump.
    pub reads: u64,
    /// Sector write count.
    pub writes: u64,
}

impl RamDisk {
    pub fn new(name: &str, num_sectors: u64) -> Self {
        Self {
            name: name.to_string(),
            data: vec![0u8; num_sectors as usize * SECTOR_SIZE],
            reads: 0,
            writes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    pub fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let start = self.byte_range(sector)?;
        buf.copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
        self.reads += 1;
        Ok(())
    }

    pub fn write_sector(&mut self, sector: u64, buf: &[u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let start = self.byte_range(sector)?;
        self.data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    /// Read `count` consecutive sectors into `buf`.
    pub fn read_sectors(&mut self, start: u64, count: usize, buf: &mut [u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), count * SECTOR_SIZE);
        for i in 0..count {
            let at = i * SECTOR_SIZE;
            self.read_sector(start + i as u64, &mut buf[at..at + SECTOR_SIZE])?;
        }
        Ok(())
    }

    /// Write `count` consecutive sectors from `buf`.
    pub fn write_sectors(&mut self, start: u64, count: usize, buf: &[u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), count * SECTOR_SIZE);
        for i in 0..count {
            let at = i * SECTOR_SIZE;
            self.write_sector(start + i as u64, &buf[at..at + SECTOR_SIZE])?;
        }
        Ok(())
    }

    fn byte_range(&self, sector: u64) -> KernelResult<usize> {
        let start = sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.data.len() {
            return Err(KernelError::Io);
        }
        Ok(start)
    }
}

/// A block device handle shareable between subsystems.
pub type SharedDisk = Arc<Mutex<RamDisk>>;

/// Named block devices, as probed at boot.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, SharedDisk>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh RAM disk under `name`, replacing nothing.
    pub fn register(&mut self, name: &str, num_sectors: u64) -> KernelResult<SharedDisk> {
        if self.devices.contains_key(name) {
            return Err(KernelError::Exist);
        }
        let dev: SharedDisk = Arc::new(Mutex::new(RamDisk::new(name, num_sectors)));
        self.devices.insert(name.to_string(), dev.clone());
        Ok(dev)
    }

    pub fn get(&self, name: &str) -> KernelResult<SharedDisk> {
        self.devices.get(name).cloned().ok_or(KernelError::NoDev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_round_trip() {
        let mut dev = RamDisk::new("ide0", 16);
        let data = [0x42u8; SECTOR_SIZE];
        dev.write_sector(3, &data).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        dev.read_sector(3, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(dev.reads, 1);
        assert_eq!(dev.writes, 1);
    }

    #[test]
    fn test_out_of_range_is_io_error() {
        let mut dev = RamDisk::new("ide0", 4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read_sector(4, &mut buf), Err(KernelError::Io));
    }

    #[test]
    fn test_registry_lookup() {
        let mut reg = DeviceRegistry::new();
        reg.register("ide0", 64).unwrap();
        assert!(reg.get("ide0").is_ok());
        assert_eq!(reg.get("ide1").unwrap_err(), KernelError::NoDev);
        assert_eq!(reg.register("ide0", 64).unwrap_err(), KernelError::Exist);
    }
}
