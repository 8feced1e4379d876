//! Virtual memory
//!
//! One kernel page directory identity-maps physical memory; each user
//! process gets its own directory with the kernel entries copied in.
//! User pages are demand-paged against a page file: when physical
//! frames run out, a victim chosen by the current paging algorithm is
//! written to a page-file slot and its owner's PTE is retagged
//! `PAGE_ON_DISK` with the slot index.

mod frame;
mod page_file;
mod page_table;
mod paging;
mod vas;

pub use frame::{Frame, FrameFlags, FrameOwner, FrameTable};
pub use page_file::PageFile;
pub use page_table::{
    KernelInfo, PageDirectory, PageTable, Pte, PteFlags, NUM_PAGE_DIR_ENTRIES,
    NUM_PAGE_TABLE_ENTRIES, PAGE_POWER,
};
pub use paging::{FaultCode, FaultOutcome, PagingAlgorithm};
pub use vas::{
    format_arg_block, ContextTable, Segment, UserContext, USER_ARG_PAGE, USER_SPACE_SIZE,
    USER_STACK_PAGE,
};

/// User-context (address-space) identifier.
pub type CtxId = u32;

/// Fault and traffic counters for the paging subsystem.
#[derive(Debug, Default)]
pub struct PagingStats {
    pub faults: u64,
}

/// The virtual-memory subsystem: physical frames, the page file, every
/// user address space, and the paging policy.
pub struct Vm {
    pub frames: FrameTable,
    pub page_file: PageFile,
    pub contexts: ContextTable,
    pub kernel_dir: PageDirectory,
    pub algorithm: PagingAlgorithm,
    pub stats: PagingStats,
    /// Current tick, mirrored in by the timer for age stamps.
    pub now: u64,
    /// WS-Clock rotation position.
    pub(crate) clock_hand: usize,
    /// Per-process open-file table size, fixed at boot.
    pub(crate) user_max_files: usize,
}

impl Vm {
    pub fn new(num_frames: usize, page_file: PageFile, user_max_files: usize) -> Self {
        Self {
            frames: FrameTable::new(num_frames),
            page_file,
            contexts: ContextTable::new(),
            kernel_dir: PageDirectory::new_kernel(num_frames),
            algorithm: PagingAlgorithm::Default,
            stats: PagingStats::default(),
            now: 0,
            clock_hand: 0,
            user_max_files,
        }
    }
}
