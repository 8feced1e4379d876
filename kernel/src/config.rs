//! Kernel configuration
//!
//! All machine shape and subsystem limits are decided here, once, when
//! the kernel is constructed. Tests build small machines (a handful of
//! frames, a few page-file slots) to force the interesting paths;
//! `Default` is the classic teaching-machine shape.

/// Bytes per physical page / page frame.
pub const PAGE_SIZE: usize = 4096;

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Sectors transferred per page-file slot operation.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Base linear address of the user region; user virtual addresses are
/// offsets from here.
pub const USER_BASE: u32 = 0x8000_0000;

/// Machine shape and subsystem limits.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of physical page frames.
    pub num_frames: usize,
    /// Page file size, in page-sized slots.
    pub page_file_pages: usize,
    /// Buffer-cache capacity, in buffers, per filesystem instance.
    pub buffer_cache_size: usize,
    /// Scheduler quantum in timer ticks.
    pub quantum: u32,
    /// Semaphore table size.
    pub max_semaphores: usize,
    /// Per-process open-file table size.
    pub user_max_files: usize,
    /// Upper bound on a single message-queue payload, in bytes.
    pub max_message_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,      // 4 MiB of pageable RAM
            page_file_pages: 256,  // 1 MiB page file
            buffer_cache_size: 32,
            quantum: 4,
            max_semaphores: 20,
            user_max_files: 10,
            max_message_size: 8192,
        }
    }
}

impl KernelConfig {
    /// A deliberately tiny machine, handy for forcing eviction and
    /// exhaustion paths in tests.
    pub fn tiny(num_frames: usize, page_file_pages: usize) -> Self {
        Self {
            num_frames,
            page_file_pages,
            buffer_cache_size: 8,
            ..Self::default()
        }
    }
}
