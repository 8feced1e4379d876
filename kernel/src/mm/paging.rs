//! Page-fault handling and frame eviction
//!
//! The fault handler runs with interrupts disabled. When it must move a
//! page to or from the page file it re-enables interrupts around the
//! device I/O; for that window the frame involved is LOCKED and not
//! PAGEABLE so no other thread can steal or free it mid-transfer, and
//! after the write completes the handler re-checks that the victim's
//! owner still exists before committing the PTE update.

use alloc::format;
use alloc::string::String;

use super::frame::{FrameFlags, FrameOwner, FrameTable};
use super::page_file::PageFile;
use super::page_table::{page_addr, KernelInfo, PteFlags};
use super::vas::ContextTable;
use super::{CtxId, Vm};
use crate::config::{PAGE_SIZE, USER_BASE};
use crate::error::{KernelError, KernelResult};
use crate::sync::IntState;

/// Decoded processor error bits for a page fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultCode {
    pub protection: bool,
    pub write: bool,
    pub user_mode: bool,
}

/// What the caller must do after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    /// Unrecoverable for this process; the kernel kills it.
    TerminateProcess,
}

/// Selectable victim-selection policy. Raw values are the syscall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingAlgorithm {
    Default = 0,
    WsClock = 1,
}

impl PagingAlgorithm {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Default),
            1 => Some(Self::WsClock),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::WsClock => "WS-clock",
        }
    }
}

/// Pick a victim frame: PAGEABLE, not LOCKED.
///
/// Default policy takes the first fit. WS-Clock rotates from the clock
/// hand: a page whose accessed bit is set gets its bit cleared and is
/// skipped this rotation; among the rest the oldest `age` wins. If
/// every page was recently accessed the second rotation decides by age
/// alone.
fn find_victim(
    frames: &mut FrameTable,
    contexts: &mut ContextTable,
    algorithm: PagingAlgorithm,
    hand: &mut usize,
) -> Option<usize> {
    let evictable = |frames: &FrameTable, idx: usize| {
        let f = frames.frame(idx);
        f.flags.contains(FrameFlags::PAGEABLE) && !f.flags.contains(FrameFlags::LOCKED)
    };

    match algorithm {
        PagingAlgorithm::Default => (0..frames.len()).find(|&idx| evictable(frames, idx)),
        PagingAlgorithm::WsClock => {
            let n = frames.len();
            let order = (*hand..n).chain(0..*hand);

            let mut best: Option<(usize, u64)> = None;
            for idx in order {
                if !evictable(frames, idx) {
                    continue;
                }
                let owner = frames.frame(idx).owner.expect("pageable frame without owner");
                let pte = contexts
                    .ctx_mut(owner.ctx)
                    .dir
                    .pte_mut(owner.vaddr)
                    .expect("pageable frame without mapping");
                if pte.accessed {
                    // second chance
                    pte.accessed = false;
                    continue;
                }
                let age = frames.frame(idx).age;
                match best {
                    Some((_, bage)) if bage <= age => {}
                    _ => best = Some((idx, age)),
                }
            }
            if best.is_none() {
                // everything had its accessed bit set; it is clear now,
                // so decide by age alone
                for idx in 0..n {
                    if !evictable(frames, idx) {
                        continue;
                    }
                    let age = frames.frame(idx).age;
                    match best {
                        Some((_, bage)) if bage <= age => {}
                        _ => best = Some((idx, age)),
                    }
                }
            }
            let (idx, _) = best?;
            *hand = (idx + 1) % n;
            Some(idx)
        }
    }
}

/// Evict one frame to the page file and return it, LOCKED and not
/// PAGEABLE, owner cleared. `Err(NoMem)` when nothing is evictable,
/// `Err(NoSpace)` when the page file is full (fatal for the faulting
/// process).
fn page_out_victim(
    ints: &mut IntState,
    frames: &mut FrameTable,
    page_file: &mut PageFile,
    contexts: &mut ContextTable,
    algorithm: PagingAlgorithm,
    hand: &mut usize,
) -> KernelResult<usize> {
    let victim =
        find_victim(frames, contexts, algorithm, hand).ok_or(KernelError::NoMem)?;
    assert!(frames.frame(victim).flags.contains(FrameFlags::PAGEABLE));

    let slot = page_file.find_space(ints).ok_or(KernelError::NoSpace)?;
    let owner = frames.frame(victim).owner.expect("victim without owner");
    log::debug!(
        "paging out frame {} (ctx {} vaddr {:#x}, age {}) to slot {}",
        victim,
        owner.ctx,
        owner.vaddr,
        frames.frame(victim).age,
        slot
    );

    // not stealable, not freeable while the write is in flight
    let frame = frames.frame_mut(victim);
    frame.flags.remove(FrameFlags::PAGEABLE);
    frame.flags.insert(FrameFlags::LOCKED);

    ints.enable();
    page_file.write_page(slot, frames.bytes(victim));
    ints.disable();

    if frames.frame(victim).flags.contains(FrameFlags::ALLOCATED) {
        // still in use: record where the page went
        let pte = contexts
            .ctx_mut(owner.ctx)
            .dir
            .pte_mut(owner.vaddr)
            .expect("victim owner lost its mapping");
        pte.present = false;
        pte.kernel_info = KernelInfo::PageOnDisk;
        pte.page_base = slot as u32;
    } else {
        // the owner freed its pages while interrupts were open; the
        // slot is not needed and the frame is ours outright
        page_file.free_space(ints, slot);
        frames.frame_mut(victim).flags.insert(FrameFlags::ALLOCATED);
    }
    frames.frame_mut(victim).owner = None;
    Ok(victim)
}

/// Produce a frame for (`ctx`, `vaddr`): a free one if available,
/// otherwise an evicted one. Returned LOCKED, not PAGEABLE, zeroed,
/// owner installed.
pub(super) fn claim_frame(
    ints: &mut IntState,
    frames: &mut FrameTable,
    page_file: &mut PageFile,
    contexts: &mut ContextTable,
    algorithm: PagingAlgorithm,
    hand: &mut usize,
    now: u64,
    ctx: CtxId,
    vaddr: u32,
) -> KernelResult<usize> {
    let idx = match frames.alloc() {
        Some(idx) => {
            frames.frame_mut(idx).flags.insert(FrameFlags::LOCKED);
            idx
        }
        None => {
            let idx = page_out_victim(ints, frames, page_file, contexts, algorithm, hand)?;
            frames.zero(idx);
            idx
        }
    };
    let frame = frames.frame_mut(idx);
    frame.owner = Some(FrameOwner {
        ctx,
        vaddr: page_addr(vaddr),
    });
    frame.age = now;
    Ok(idx)
}

impl Vm {
    /// Allocate a pageable, zero-filled frame for (`ctx`, `vaddr`).
    pub fn alloc_pageable_page(
        &mut self,
        ints: &mut IntState,
        ctx: CtxId,
        vaddr: u32,
    ) -> KernelResult<usize> {
        let iflag = ints.begin_atomic();
        let Vm {
            frames,
            page_file,
            contexts,
            algorithm,
            clock_hand,
            now,
            ..
        } = self;
        let result = claim_frame(
            ints, frames, page_file, contexts, *algorithm, clock_hand, *now, ctx, vaddr,
        );
        let result = result.map(|idx| {
            let frame = frames.frame_mut(idx);
            frame.flags.remove(FrameFlags::LOCKED);
            frame.flags.insert(FrameFlags::PAGEABLE);
            idx
        });
        ints.end_atomic(iflag);
        result
    }

    /// The page-fault handler. `linear` is the faulting linear address;
    /// interrupts are disabled on entry and on exit.
    pub fn handle_page_fault(
        &mut self,
        ints: &mut IntState,
        ctx_id: CtxId,
        linear: u32,
        code: FaultCode,
    ) -> FaultOutcome {
        assert!(!ints.enabled());
        log::debug!("page fault @{:#x}, ctx {}", linear, ctx_id);

        // the first page of the kernel and of every process traps null
        // dereferences
        if linear < PAGE_SIZE as u32
            || (USER_BASE..USER_BASE + PAGE_SIZE as u32).contains(&linear)
        {
            log::warn!("null pointer dereferenced in ctx {}", ctx_id);
            return FaultOutcome::TerminateProcess;
        }

        // protection violations and kernel-mode surprises are both
        // unrecoverable for the offending process
        if code.protection || !code.user_mode {
            log::warn!(
                "unexpected page fault @{:#x} (protection={}, write={}, user={})",
                linear,
                code.protection,
                code.write,
                code.user_mode
            );
            return FaultOutcome::TerminateProcess;
        }

        self.stats.faults += 1;

        let vaddr = page_addr(linear);
        let (on_disk, slot) = {
            let pte = self.contexts.ctx_mut(ctx_id).dir.ensure_table(linear);
            (
                pte.kernel_info == KernelInfo::PageOnDisk,
                pte.page_base as usize,
            )
        };

        if on_disk {
            let Vm {
                frames,
                page_file,
                contexts,
                algorithm,
                clock_hand,
                now,
                ..
            } = self;
            let idx = match claim_frame(
                ints, frames, page_file, contexts, *algorithm, clock_hand, *now, ctx_id, vaddr,
            ) {
                Ok(idx) => idx,
                Err(KernelError::NoSpace) => {
                    log::warn!("paging file is full, aborting ctx {}", ctx_id);
                    return FaultOutcome::TerminateProcess;
                }
                Err(e) => panic!("page-in allocation failed: {}", e),
            };

            let pte = contexts
                .ctx_mut(ctx_id)
                .dir
                .pte_mut(linear)
                .expect("fault target table vanished");
            pte.present = true;
            pte.accessed = false;
            pte.dirty = false;
            pte.kernel_info = KernelInfo::None;
            pte.page_base = idx as u32;

            log::debug!("reading frame {} from paging file slot {}", idx, slot);
            ints.enable();
            page_file.read_page(slot, frames.bytes_mut(idx));
            ints.disable();
            page_file.free_space(ints, slot);

            let frame = frames.frame_mut(idx);
            frame.flags.remove(FrameFlags::LOCKED);
            frame.flags.insert(FrameFlags::PAGEABLE);
            assert!(frame.flags.contains(FrameFlags::ALLOCATED));
        } else {
            // heap or stack is growing into a never-mapped page
            if !code.write {
                log::debug!("read of an uninitialized page @{:#x}", linear);
            }
            let idx = match self.alloc_pageable_page(ints, ctx_id, vaddr) {
                Ok(idx) => idx,
                Err(KernelError::NoSpace) => {
                    log::warn!("paging file is full, aborting ctx {}", ctx_id);
                    return FaultOutcome::TerminateProcess;
                }
                Err(e) => panic!("page allocation failed: {}", e),
            };
            let pte = self
                .contexts
                .ctx_mut(ctx_id)
                .dir
                .pte_mut(linear)
                .expect("fault target table vanished");
            pte.present = true;
            pte.flags = PteFlags::user_rwx();
            pte.accessed = false;
            pte.dirty = false;
            pte.kernel_info = KernelInfo::None;
            pte.page_base = idx as u32;
        }
        FaultOutcome::Resolved
    }

    /// Periodic cleaner: refresh the age of pages observed accessed
    /// since the last tick, then clear every accessed bit. Runs from
    /// the timer with interrupts disabled.
    pub fn page_cleaner(&mut self, ints: &IntState) {
        assert!(!ints.enabled());
        let Vm {
            frames,
            contexts,
            now,
            ..
        } = self;
        for idx in 0..frames.len() {
            let Some(owner) = frames.frame(idx).owner else {
                continue;
            };
            let Some(ctx) = contexts.get_mut(owner.ctx) else {
                continue;
            };
            let Some(pte) = ctx.dir.pte_mut(owner.vaddr) else {
                continue;
            };
            if pte.accessed {
                frames.frame_mut(idx).age = *now;
            }
            pte.accessed = false;
        }
    }

    /// Select the paging algorithm at runtime.
    pub fn select_algorithm(&mut self, raw: u32) -> KernelResult<()> {
        self.algorithm = PagingAlgorithm::from_raw(raw).ok_or(KernelError::Unsupported)?;
        Ok(())
    }

    /// Diagnostic dump, as printed by the sys-info syscall.
    pub fn paging_info(&self) -> String {
        format!(
            "Paging algorithm {}\n\
             RAM Pages: total={}, free={}, faults={}, allocated={}, freed={}\n\
             Page file: size={}, writes={}, reads={}, paged out={}\n",
            self.algorithm.name(),
            self.frames.len(),
            self.frames.free_count(),
            self.stats.faults,
            self.frames.stats.allocated,
            self.frames.stats.freed,
            self.page_file.num_pages(),
            self.page_file.stats.writes,
            self.page_file.stats.reads,
            self.page_file.slots_used(),
        )
    }

    /// Cross-check the frame/PTE/page-file invariants; panics on any
    /// violation. Cheap enough for tests to call after every phase.
    pub fn verify_frame_invariants(&self) {
        for (idx, frame) in self.frames.iter() {
            if let Some(owner) = frame.owner {
                assert!(
                    frame.flags.contains(FrameFlags::ALLOCATED),
                    "owned frame {} not allocated",
                    idx
                );
                let pte = self
                    .contexts
                    .ctx(owner.ctx)
                    .dir
                    .pte(owner.vaddr)
                    .expect("owner mapping missing");
                assert!(pte.present, "frame {} owner PTE not present", idx);
                assert_eq!(pte.page_base as usize, idx, "frame {} back-pointer", idx);
            }
        }
        // every PAGE_ON_DISK tag names exactly one occupied slot
        let mut seen = alloc::collections::BTreeSet::new();
        for ctx in self.contexts.iter() {
            for (_, table) in ctx.dir.user_tables() {
                for pte in table.iter() {
                    if pte.kernel_info == KernelInfo::PageOnDisk {
                        assert!(!pte.present);
                        let slot = pte.page_base as usize;
                        assert!(
                            self.page_file.is_slot_used(slot),
                            "on-disk PTE names free slot {}",
                            slot
                        );
                        assert!(seen.insert(slot), "slot {} referenced twice", slot);
                    }
                }
            }
        }
    }
}
