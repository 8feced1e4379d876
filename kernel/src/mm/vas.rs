//! User address spaces
//!
//! Each process owns a page directory (kernel entries copied in), two
//! LDT segment descriptors covering the user region, an open-file
//! table, and the demand-paged pages backing its image, heap, argument
//! block and stack. User virtual addresses are offsets from
//! `USER_BASE`; the kernel never dereferences them directly, it
//! translates page by page through the owning directory.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::frame::FrameFlags;
use super::page_table::{page_addr, KernelInfo, PageDirectory, Pte, PteFlags};
use super::paging::claim_frame;
use super::{CtxId, Vm};
use crate::config::{PAGE_SIZE, USER_BASE};
use crate::error::{KernelError, KernelResult};
use crate::fs::file::File;
use crate::sync::IntState;

/// Length of the user segment: user addresses run 0..USER_SPACE_SIZE.
pub const USER_SPACE_SIZE: u32 = 0x8000_0000;

/// User address of the single stack page, at the very top of the range.
pub const USER_STACK_PAGE: u32 = USER_SPACE_SIZE - PAGE_SIZE as u32;

/// User address of the argument-block page, just below the stack.
pub const USER_ARG_PAGE: u32 = USER_STACK_PAGE - PAGE_SIZE as u32;

/// An LDT segment descriptor (code or data) covering the user region.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub base: u32,
    pub limit_pages: u32,
    pub user: bool,
}

/// Per-process address-space state.
#[derive(Debug)]
pub struct UserContext {
    pub dir: PageDirectory,
    /// Bytes of the initially mapped image region.
    pub size: u32,
    /// Heap break; pages past the image materialize on first touch.
    pub brk: u32,
    pub entry_addr: u32,
    pub arg_block_addr: u32,
    pub stack_ptr_addr: u32,
    pub euid: u32,
    /// Threads sharing this context; the space is destroyed at zero.
    pub ref_count: u32,
    pub files: Vec<Option<File>>,
    pub code_seg: Segment,
    pub data_seg: Segment,
}

impl UserContext {
    fn new(dir: PageDirectory, max_files: usize) -> Self {
        let seg = Segment {
            base: USER_BASE,
            limit_pages: USER_SPACE_SIZE >> 12,
            user: true,
        };
        Self {
            dir,
            size: 0,
            brk: 0,
            entry_addr: 0,
            arg_block_addr: 0,
            stack_ptr_addr: 0,
            euid: 0,
            ref_count: 0,
            files: (0..max_files).map(|_| None).collect(),
            code_seg: seg,
            data_seg: seg,
        }
    }

    /// First free open-file slot.
    pub fn alloc_fd(&self) -> KernelResult<usize> {
        self.files
            .iter()
            .position(|f| f.is_none())
            .ok_or(KernelError::UsrMaxFiles)
    }
}

/// All live address spaces, keyed by context id.
#[derive(Debug, Default)]
pub struct ContextTable {
    contexts: BTreeMap<CtxId, UserContext>,
    next_id: CtxId,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            contexts: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, ctx: UserContext) -> CtxId {
        let id = self.next_id;
        self.next_id += 1;
        self.contexts.insert(id, ctx);
        id
    }

    pub fn get(&self, id: CtxId) -> Option<&UserContext> {
        self.contexts.get(&id)
    }

    pub fn get_mut(&mut self, id: CtxId) -> Option<&mut UserContext> {
        self.contexts.get_mut(&id)
    }

    /// Panicking accessor for contexts that must exist.
    pub fn ctx(&self, id: CtxId) -> &UserContext {
        self.contexts.get(&id).expect("no such user context")
    }

    /// Panicking mutable accessor for contexts that must exist.
    pub fn ctx_mut(&mut self, id: CtxId) -> &mut UserContext {
        self.contexts.get_mut(&id).expect("no such user context")
    }

    fn remove(&mut self, id: CtxId) -> Option<UserContext> {
        self.contexts.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserContext> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Pack `argc`, the `argv` pointer array, and the argument strings into
/// one block image. Pointers are user addresses assuming the block is
/// copied to `base_uaddr`.
pub fn format_arg_block(command: &str, base_uaddr: u32) -> KernelResult<Vec<u8>> {
    let args: Vec<&str> = command.split_whitespace().collect();
    let header_len = 4 + 4 * args.len();
    let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
    if header_len + strings_len > PAGE_SIZE {
        return Err(KernelError::Invalid);
    }

    let mut block = Vec::with_capacity(header_len + strings_len);
    block.extend_from_slice(&(args.len() as u32).to_le_bytes());
    let mut str_at = header_len;
    for arg in &args {
        block.extend_from_slice(&(base_uaddr + str_at as u32).to_le_bytes());
        str_at += arg.len() + 1;
    }
    for arg in &args {
        block.extend_from_slice(arg.as_bytes());
        block.push(0);
    }
    Ok(block)
}

impl Vm {
    /// Build a fresh address space: pageable zero-filled pages covering
    /// the image span (the first page stays unmapped as the null
    /// guard), one argument-block page and one stack page at the top.
    pub fn create_context(&mut self, ints: &mut IntState, image_span: u32) -> KernelResult<CtxId> {
        let span = (image_span as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let id = self.contexts.insert(UserContext::new(
            PageDirectory::new_user(&self.kernel_dir),
            self.user_max_files,
        ));

        let mut build = || -> KernelResult<()> {
            let mut uaddr = PAGE_SIZE as u32;
            while (uaddr as usize) < span {
                self.map_fresh_page(ints, id, uaddr)?;
                uaddr += PAGE_SIZE as u32;
            }
            self.map_fresh_page(ints, id, USER_ARG_PAGE)?;
            self.map_fresh_page(ints, id, USER_STACK_PAGE)?;
            Ok(())
        };
        if let Err(e) = build() {
            self.free_address_space(ints, id);
            return Err(e);
        }

        let ctx = self.contexts.ctx_mut(id);
        ctx.size = span as u32;
        ctx.brk = span as u32;
        ctx.arg_block_addr = USER_ARG_PAGE;
        ctx.stack_ptr_addr = USER_SPACE_SIZE;
        log::debug!("created user context {} ({} image bytes)", id, span);
        Ok(id)
    }

    /// Map one new pageable zero page at user address `uaddr`.
    fn map_fresh_page(&mut self, ints: &mut IntState, ctx: CtxId, uaddr: u32) -> KernelResult<()> {
        let linear = USER_BASE.wrapping_add(uaddr);
        let idx = self.alloc_pageable_page(ints, ctx, linear)?;
        let pte = self.contexts.ctx_mut(ctx).dir.ensure_table(linear);
        *pte = Pte {
            present: true,
            flags: PteFlags::user_rwx(),
            page_base: idx as u32,
            ..Pte::default()
        };
        Ok(())
    }

    /// Tear down an address space: every user frame freed, every
    /// page-file slot released, page tables and directory dropped.
    /// Open files are returned for the caller to close (closing can
    /// wake other threads, which is scheduler business, not VM
    /// business).
    pub fn free_address_space(&mut self, ints: &mut IntState, id: CtxId) -> Vec<Option<File>> {
        let mut ctx = self.contexts.remove(id).expect("no such user context");
        assert_eq!(ctx.ref_count, 0, "freeing a shared address space");

        let iflag = ints.begin_atomic();
        for (_, table) in ctx.dir.user_tables() {
            for pte in table.iter() {
                if pte.present {
                    self.frames.free(pte.page_base as usize);
                } else if pte.kernel_info == KernelInfo::PageOnDisk {
                    self.page_file.free_space(ints, pte.page_base as usize);
                }
            }
        }
        ints.end_atomic(iflag);
        log::debug!("destroyed user context {}", id);
        core::mem::take(&mut ctx.files)
    }

    /// Clear the write permission on every present page covering
    /// `uaddr..uaddr+len`. Spawn seals loaded text this way; a user
    /// store to a sealed page raises a protection fault. Kernel copies
    /// run in supervisor mode and are not bound by the bit.
    pub fn write_protect(&mut self, ctx_id: CtxId, uaddr: u32, len: usize) {
        if len == 0 {
            return;
        }
        let ctx = self.contexts.ctx_mut(ctx_id);
        let start = USER_BASE.wrapping_add(uaddr);
        let first = page_addr(start);
        let last = page_addr(start.wrapping_add(len as u32 - 1));
        let count = (last - first) / PAGE_SIZE as u32 + 1;
        for page in 0..count {
            let linear = first.wrapping_add(page * PAGE_SIZE as u32);
            if let Some(pte) = ctx.dir.pte_mut(linear) {
                if pte.present {
                    pte.flags.remove(PteFlags::WRITE);
                }
            }
        }
    }

    /// Move the heap break by `increment` bytes, returning the old
    /// break. Pages in the grown region appear on first touch.
    pub fn sbrk(&mut self, ctx_id: CtxId, increment: i32) -> KernelResult<u32> {
        let ctx = self.contexts.get_mut(ctx_id).ok_or(KernelError::Invalid)?;
        let old = ctx.brk;
        let new = old as i64 + increment as i64;
        if new < ctx.size as i64 || new > USER_ARG_PAGE as i64 {
            return Err(KernelError::NoMem);
        }
        ctx.brk = new as u32;
        Ok(old)
    }

    /// Copy a kernel buffer into user memory. Walks the destination
    /// page by page through the user directory, paging in from the
    /// page file where needed; each frame is LOCKED and not PAGEABLE
    /// for the duration of its memcpy. Returns success.
    pub fn copy_to_user(
        &mut self,
        ints: &mut IntState,
        ctx_id: CtxId,
        dest: u32,
        src: &[u8],
    ) -> bool {
        self.copy_user(ints, ctx_id, dest, src.len(), |frames, idx, off, done, n| {
            frames.bytes_mut(idx)[off..off + n].copy_from_slice(&src[done..done + n]);
        })
    }

    /// Copy user memory into a kernel buffer. Same page walk and
    /// locking discipline as [`copy_to_user`](Self::copy_to_user).
    pub fn copy_from_user(
        &mut self,
        ints: &mut IntState,
        ctx_id: CtxId,
        dest: &mut [u8],
        src: u32,
    ) -> bool {
        let len = dest.len();
        self.copy_user(ints, ctx_id, src, len, |frames, idx, off, done, n| {
            dest[done..done + n].copy_from_slice(&frames.bytes(idx)[off..off + n]);
        })
    }

    fn copy_user(
        &mut self,
        ints: &mut IntState,
        ctx_id: CtxId,
        uaddr: u32,
        len: usize,
        mut xfer: impl FnMut(&mut super::frame::FrameTable, usize, usize, usize, usize),
    ) -> bool {
        if len == 0 {
            return true;
        }
        match uaddr.checked_add(len as u32) {
            Some(end) if end <= USER_SPACE_SIZE => {}
            _ => return false,
        }
        if self.contexts.get(ctx_id).is_none() {
            return false;
        }

        let mut linear = USER_BASE.wrapping_add(uaddr);
        let mut done = 0usize;
        while done < len {
            let page = page_addr(linear);
            let iflag = ints.begin_atomic();
            let idx = match self.resolve_user_page(ints, ctx_id, page) {
                Ok(idx) => idx,
                Err(_) => {
                    log::warn!("user copy hit unmapped page @{:#x} in ctx {}", page, ctx_id);
                    ints.end_atomic(iflag);
                    return false;
                }
            };

            {
                let frame = self.frames.frame_mut(idx);
                frame.flags.remove(FrameFlags::PAGEABLE);
                frame.flags.insert(FrameFlags::LOCKED);
                assert!(frame.flags.contains(FrameFlags::ALLOCATED));
            }

            let off = (linear - page) as usize;
            let n = core::cmp::min(PAGE_SIZE - off, len - done);
            xfer(&mut self.frames, idx, off, done, n);

            // model the hardware access/dirty bits the copy would set
            let now = self.now;
            if let Some(pte) = self.contexts.ctx_mut(ctx_id).dir.pte_mut(page) {
                pte.accessed = true;
                pte.dirty = true;
            }
            let frame = self.frames.frame_mut(idx);
            frame.age = now;
            frame.flags.insert(FrameFlags::PAGEABLE);
            frame.flags.remove(FrameFlags::LOCKED);
            ints.end_atomic(iflag);

            done += n;
            linear = linear.wrapping_add(n as u32);
        }
        true
    }

    /// Resolve one user page to a frame, paging it in from the page
    /// file if it was evicted. Fails on unmapped pages; copies never
    /// grow an address space.
    fn resolve_user_page(
        &mut self,
        ints: &mut IntState,
        ctx_id: CtxId,
        page: u32,
    ) -> KernelResult<usize> {
        let slot = {
            let ctx = self.contexts.ctx(ctx_id);
            match ctx.dir.pte(page) {
                None => return Err(KernelError::Invalid),
                Some(pte) if pte.present => return Ok(pte.page_base as usize),
                Some(pte) if pte.kernel_info == KernelInfo::PageOnDisk => pte.page_base as usize,
                Some(_) => return Err(KernelError::Invalid),
            }
        };

        let Vm {
            frames,
            page_file,
            contexts,
            algorithm,
            clock_hand,
            now,
            ..
        } = self;
        let idx = claim_frame(
            ints, frames, page_file, contexts, *algorithm, clock_hand, *now, ctx_id, page,
        )?;

        let pte = contexts
            .ctx_mut(ctx_id)
            .dir
            .pte_mut(page)
            .expect("paged-out PTE vanished");
        pte.present = true;
        pte.kernel_info = KernelInfo::None;
        pte.page_base = idx as u32;

        log::debug!("user copy paging in slot {} for @{:#x}", slot, page);
        ints.enable();
        page_file.read_page(slot, frames.bytes_mut(idx));
        ints.disable();
        page_file.free_space(ints, slot);
        // caller unlocks after its memcpy
        Ok(idx)
    }
}
