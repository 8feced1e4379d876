//! Physical frame table
//!
//! One descriptor per page frame plus the frame storage itself. A
//! frame's owner back-reference is stored as (context id, virtual
//! address) rather than a pointer; the paging code keeps it consistent
//! with the owning PTE.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::mm::CtxId;

bitflags! {
    /// Frame state bits.
    ///
    /// Every ALLOCATED frame is LOCKED (not evictable), PAGEABLE
    /// (evictable), or neither (transient, mid-setup).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const ALLOCATED = 1 << 0;
        const PAGEABLE  = 1 << 1;
        const LOCKED    = 1 << 2;
    }
}

/// The user page a frame currently backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub ctx: CtxId,
    /// Page-aligned linear address of the mapping.
    pub vaddr: u32,
}

/// Per-frame descriptor. The physical address is implicit in the index.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    pub owner: Option<FrameOwner>,
    /// Tick of the last observed access, for WS-Clock.
    pub age: u64,
}

impl Frame {
    const fn free() -> Self {
        Self {
            flags: FrameFlags::empty(),
            owner: None,
            age: 0,
        }
    }
}

/// Allocation counters for the sys-info dump.
#[derive(Debug, Default)]
pub struct FrameStats {
    pub allocated: u64,
    pub freed: u64,
}

#[derive(Debug)]
pub struct FrameTable {
    frames: Vec<Frame>,
    data: Vec<u8>,
    free_count: usize,
    pub stats: FrameStats,
}

impl FrameTable {
    pub fn new(num_frames: usize) -> Self {
        Self {
            frames: vec![Frame::free(); num_frames],
            data: vec![0u8; num_frames * PAGE_SIZE],
            free_count: num_frames,
            stats: FrameStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Claim the first free frame, zeroed, flags ALLOCATED only.
    pub fn alloc(&mut self) -> Option<usize> {
        let idx = self
            .frames
            .iter()
            .position(|f| !f.flags.contains(FrameFlags::ALLOCATED))?;
        let frame = &mut self.frames[idx];
        frame.flags = FrameFlags::ALLOCATED;
        frame.owner = None;
        frame.age = 0;
        self.free_count -= 1;
        self.stats.allocated += 1;
        self.zero(idx);
        Some(idx)
    }

    /// Return a frame to the free pool.
    pub fn free(&mut self, idx: usize) {
        let frame = &mut self.frames[idx];
        assert!(frame.flags.contains(FrameFlags::ALLOCATED));
        frame.flags = FrameFlags::empty();
        frame.owner = None;
        frame.age = 0;
        self.free_count += 1;
        self.stats.freed += 1;
    }

    pub fn frame(&self, idx: usize) -> &Frame {
        &self.frames[idx]
    }

    pub fn frame_mut(&mut self, idx: usize) -> &mut Frame {
        &mut self.frames[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Frame)> {
        self.frames.iter().enumerate()
    }

    pub fn bytes(&self, idx: usize) -> &[u8] {
        &self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
    }

    pub fn bytes_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
    }

    pub fn zero(&mut self, idx: usize) {
        self.bytes_mut(idx).fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let mut table = FrameTable::new(4);
        assert_eq!(table.free_count(), 4);
        let a = table.alloc().unwrap();
        let b = table.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.free_count(), 2);
        assert!(table.frame(a).flags.contains(FrameFlags::ALLOCATED));
        table.free(a);
        assert_eq!(table.free_count(), 3);
        assert_eq!(table.stats.allocated, 2);
        assert_eq!(table.stats.freed, 1);
        // freed frame is handed out again
        assert_eq!(table.alloc(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut table = FrameTable::new(2);
        table.alloc().unwrap();
        table.alloc().unwrap();
        assert_eq!(table.alloc(), None);
    }

    #[test]
    fn test_alloc_zeroes_data() {
        let mut table = FrameTable::new(1);
        let idx = table.alloc().unwrap();
        table.bytes_mut(idx).fill(0xAB);
        table.free(idx);
        let idx = table.alloc().unwrap();
        assert!(table.bytes(idx).iter().all(|&b| b == 0));
    }
}
