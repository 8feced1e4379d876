//! Executable images
//!
//! ELF decoding proper is a pure collaborator invoked once per spawn;
//! the kernel only consumes its output: segments to place in the new
//! address space and an entry point. [`FlatLoader`] is the trivial
//! decoder used by tests, treating the whole file as one segment just
//! past the null-guard page.

use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};

/// One loadable segment, placed at a user virtual address. Pages of a
/// non-writable segment are sealed read-only once the image is in
/// place; a user store to them is a protection fault.
#[derive(Debug, Clone)]
pub struct ExeSegment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub writable: bool,
}

/// A decoded executable.
#[derive(Debug, Clone)]
pub struct Exe {
    pub entry: u32,
    pub segments: Vec<ExeSegment>,
}

impl Exe {
    /// Bytes of user address space the image spans.
    pub fn span(&self) -> u32 {
        self.segments
            .iter()
            .map(|s| s.vaddr + s.data.len() as u32)
            .max()
            .unwrap_or(0)
    }
}

/// The executable-format decoder the spawn path calls.
pub trait Loader {
    fn parse(&self, image: &[u8]) -> KernelResult<Exe>;
}

/// Flat images: the file content is the text segment, loaded read-only
/// at the first mappable user page.
pub struct FlatLoader;

impl Loader for FlatLoader {
    fn parse(&self, image: &[u8]) -> KernelResult<Exe> {
        if image.is_empty() {
            return Err(KernelError::NoExec);
        }
        let vaddr = PAGE_SIZE as u32;
        Ok(Exe {
            entry: vaddr,
            segments: alloc::vec![ExeSegment {
                vaddr,
                data: image.to_vec(),
                writable: false,
            }],
        })
    }
}
