//! Buffer cache for filesystem blocks
//!
//! Maps (device, block number) to fixed-size in-memory buffers with a
//! dirty flag and a pin count. A buffer is owned between `get` and
//! `release`; a second `get` on a pinned buffer parks the caller until
//! the holder releases. Mutations must be announced with `modify` or
//! they are lost on eviction. Replacement is LRU over unpinned
//! buffers; dirty victims are written back first. `sync` writes back
//! everything dirty.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::SharedDisk;
use crate::sched::Exec;
use crate::sync::WaitQueue;

/// A pinned buffer, valid until `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufHandle(usize);

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Debug)]
struct Buffer {
    block: u64,
    data: Vec<u8>,
    dirty: bool,
    pinned: bool,
    last_used: u64,
}

#[derive(Debug)]
pub struct FsBufferCache {
    dev: SharedDisk,
    block_size: usize,
    capacity: usize,
    buffers: Vec<Buffer>,
    use_clock: u64,
    wait: WaitQueue,
    pub stats: CacheStats,
}

impl FsBufferCache {
    pub fn new(dev: SharedDisk, block_size: usize, capacity: usize) -> Self {
        assert!(block_size % SECTOR_SIZE == 0 && block_size > 0);
        assert!(capacity > 0);
        Self {
            dev,
            block_size,
            capacity,
            buffers: Vec::new(),
            use_clock: 0,
            wait: WaitQueue::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pin the buffer for `block`, reading it from disk on first use.
    /// Blocks the caller while another thread holds the buffer.
    pub fn get(&mut self, block: u64, exec: &mut Exec) -> KernelResult<BufHandle> {
        if let Some(at) = self.buffers.iter().position(|b| b.block == block) {
            if self.buffers[at].pinned {
                return Err(exec.block_on(&mut self.wait));
            }
            self.stats.hits += 1;
            self.touch(at);
            self.buffers[at].pinned = true;
            return Ok(BufHandle(at));
        }

        self.stats.misses += 1;
        let at = if self.buffers.len() < self.capacity {
            self.buffers.push(Buffer {
                block,
                data: vec![0u8; self.block_size],
                dirty: false,
                pinned: false,
                last_used: 0,
            });
            self.buffers.len() - 1
        } else {
            let at = match self.lru_unpinned() {
                Some(at) => at,
                // every buffer is pinned; wait for a release
                None => return Err(exec.block_on(&mut self.wait)),
            };
            if self.buffers[at].dirty {
                self.write_back(at)?;
            }
            self.stats.evictions += 1;
            self.buffers[at].block = block;
            self.buffers[at].dirty = false;
            at
        };

        self.read_in(at)?;
        self.touch(at);
        self.buffers[at].pinned = true;
        Ok(BufHandle(at))
    }

    pub fn data(&self, h: BufHandle) -> &[u8] {
        debug_assert!(self.buffers[h.0].pinned);
        &self.buffers[h.0].data
    }

    pub fn data_mut(&mut self, h: BufHandle) -> &mut [u8] {
        debug_assert!(self.buffers[h.0].pinned);
        &mut self.buffers[h.0].data
    }

    /// Mark the buffer dirty; without this, writes to the buffer are
    /// discarded on eviction.
    pub fn modify(&mut self, h: BufHandle) {
        debug_assert!(self.buffers[h.0].pinned);
        self.buffers[h.0].dirty = true;
    }

    /// Unpin the buffer and hand it to the next waiter, if any.
    pub fn release(&mut self, h: BufHandle, exec: &mut Exec) {
        assert!(self.buffers[h.0].pinned, "releasing an unpinned buffer");
        self.buffers[h.0].pinned = false;
        exec.wake_one(&mut self.wait);
    }

    /// Write back every dirty buffer.
    pub fn sync(&mut self) -> KernelResult<()> {
        for at in 0..self.buffers.len() {
            if self.buffers[at].dirty {
                self.write_back(at)?;
            }
        }
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.dirty).count()
    }

    fn touch(&mut self, at: usize) {
        self.use_clock += 1;
        self.buffers[at].last_used = self.use_clock;
    }

    fn lru_unpinned(&self) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.pinned)
            .min_by_key(|(_, b)| b.last_used)
            .map(|(at, _)| at)
    }

    fn sectors_per_block(&self) -> usize {
        self.block_size / SECTOR_SIZE
    }

    fn read_in(&mut self, at: usize) -> KernelResult<()> {
        let spb = self.sectors_per_block();
        let start = self.buffers[at].block * spb as u64;
        self.dev
            .lock()
            .read_sectors(start, spb, &mut self.buffers[at].data)
    }

    fn write_back(&mut self, at: usize) -> KernelResult<()> {
        let spb = self.sectors_per_block();
        let start = self.buffers[at].block * spb as u64;
        self.dev
            .lock()
            .write_sectors(start, spb, &self.buffers[at].data)?;
        self.buffers[at].dirty = false;
        self.stats.writebacks += 1;
        Ok(())
    }
}
