//! The page file
//!
//! A contiguous region of the paging device carved into page-sized
//! slots with a bitmap of occupied slots. Slot I/O moves
//! `SECTORS_PER_PAGE` consecutive sectors at a time.

use crate::config::{PAGE_SIZE, SECTORS_PER_PAGE};
use crate::fs::blockdev::SharedDisk;
use crate::sync::IntState;
use crate::util::Bitmap;

/// Page-file traffic counters.
#[derive(Debug, Default)]
pub struct PageFileStats {
    pub writes: u64,
    pub reads: u64,
}

#[derive(Debug)]
pub struct PageFile {
    dev: SharedDisk,
    start_sector: u64,
    slots: Bitmap,
    pub stats: PageFileStats,
}

impl PageFile {
    pub fn new(dev: SharedDisk, start_sector: u64, num_pages: usize) -> Self {
        {
            let dev = dev.lock();
            let needed = start_sector + (num_pages * SECTORS_PER_PAGE) as u64;
            assert!(
                needed <= dev.num_sectors(),
                "page file does not fit on paging device"
            );
            log::debug!(
                "paging device '{}', start sector {}, {} page slots",
                dev.name(),
                start_sector,
                num_pages
            );
        }
        Self {
            dev,
            start_sector,
            slots: Bitmap::new(num_pages),
            stats: PageFileStats::default(),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.slots.len()
    }

    pub fn slots_used(&self) -> usize {
        self.slots.count_set()
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        self.slots.is_set(slot)
    }

    /// Claim the first free slot. Interrupts must be disabled.
    pub fn find_space(&mut self, ints: &IntState) -> Option<usize> {
        assert!(!ints.enabled());
        let slot = self.slots.find_first_clear()?;
        self.slots.set(slot);
        Some(slot)
    }

    /// Release a slot. Interrupts must be disabled.
    pub fn free_space(&mut self, ints: &IntState, slot: usize) {
        assert!(!ints.enabled());
        assert!(self.slots.is_set(slot), "freeing a free page-file slot");
        self.slots.clear(slot);
    }

    /// Write one page into `slot`. The caller holds the frame LOCKED
    /// and has re-enabled interrupts for the duration.
    pub fn write_page(&mut self, slot: usize, data: &[u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        assert!(self.slots.is_set(slot));
        let start = self.slot_sector(slot);
        self.dev
            .lock()
            .write_sectors(start, SECTORS_PER_PAGE, data)
            .expect("paging device write failed");
        self.stats.writes += 1;
    }

    /// Read one page from `slot`.
    pub fn read_page(&mut self, slot: usize, out: &mut [u8]) {
        assert_eq!(out.len(), PAGE_SIZE);
        assert!(self.slots.is_set(slot));
        let start = self.slot_sector(slot);
        self.dev
            .lock()
            .read_sectors(start, SECTORS_PER_PAGE, out)
            .expect("paging device read failed");
        self.stats.reads += 1;
    }

    fn slot_sector(&self, slot: usize) -> u64 {
        self.start_sector + (slot * SECTORS_PER_PAGE) as u64
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use spin::Mutex;

    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn page_file(pages: usize) -> PageFile {
        let dev = Arc::new(Mutex::new(RamDisk::new(
            "paging",
            (pages * SECTORS_PER_PAGE) as u64,
        )));
        PageFile::new(dev, 0, pages)
    }

    #[test]
    fn test_slot_allocation_first_fit() {
        let mut ints = IntState::new();
        let iflag = ints.begin_atomic();
        let mut pf = page_file(3);
        assert_eq!(pf.find_space(&ints), Some(0));
        assert_eq!(pf.find_space(&ints), Some(1));
        pf.free_space(&ints, 0);
        assert_eq!(pf.find_space(&ints), Some(0));
        assert_eq!(pf.find_space(&ints), Some(2));
        assert_eq!(pf.find_space(&ints), None, "page file full");
        ints.end_atomic(iflag);
    }

    #[test]
    fn test_page_round_trip() {
        let mut ints = IntState::new();
        let iflag = ints.begin_atomic();
        let mut pf = page_file(2);
        let slot = pf.find_space(&ints).unwrap();
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        pf.write_page(slot, &page);
        let mut back = [0u8; PAGE_SIZE];
        pf.read_page(slot, &mut back);
        assert_eq!(page[..], back[..]);
        assert_eq!(pf.stats.writes, 1);
        assert_eq!(pf.stats.reads, 1);
        ints.end_atomic(iflag);
    }
}
