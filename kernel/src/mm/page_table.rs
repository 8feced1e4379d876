//! Page directories and page tables
//!
//! Two-level translation: 10 bits of directory index, 10 bits of table
//! index, 12 bits of page offset. A not-present PTE whose kernel-info
//! tag is `PageOnDisk` holds a page-file slot index in its address
//! field instead of a frame number.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;

pub const NUM_PAGE_DIR_ENTRIES: usize = 1024;
pub const NUM_PAGE_TABLE_ENTRIES: usize = 1024;
pub const PAGE_POWER: u32 = 12;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PteFlags: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

impl PteFlags {
    pub fn user_rwx() -> Self {
        Self::READ | Self::WRITE | Self::EXEC | Self::USER
    }

    pub fn kernel_rwx() -> Self {
        Self::READ | Self::WRITE | Self::EXEC
    }
}

/// Kernel bookkeeping tag squirreled into the PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelInfo {
    #[default]
    None,
    /// Not present in memory; the address field is a page-file slot.
    PageOnDisk,
}

/// A page-table entry. When `present`, `page_base` is a frame index;
/// when tagged [`KernelInfo::PageOnDisk`], it is a page-file slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pte {
    pub present: bool,
    pub flags: PteFlags,
    pub accessed: bool,
    pub dirty: bool,
    pub kernel_info: KernelInfo,
    pub page_base: u32,
}

#[derive(Debug)]
pub struct PageTable {
    entries: Vec<Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: vec![Pte::default(); NUM_PAGE_TABLE_ENTRIES],
        }
    }

    pub fn entry(&self, idx: usize) -> &Pte {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut Pte {
        &mut self.entries[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pte> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pte> {
        self.entries.iter_mut()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One directory slot. Kernel-region entries are shared identity
/// mappings (`kernel` set, no owned table); user-region entries own
/// their page table.
#[derive(Debug, Default)]
pub struct PageDirEntry {
    pub present: bool,
    pub flags: PteFlags,
    pub kernel: bool,
    pub table: Option<PageTable>,
}

#[derive(Debug)]
pub struct PageDirectory {
    entries: Vec<PageDirEntry>,
}

pub fn dir_index(linear: u32) -> usize {
    (linear >> 22) as usize
}

pub fn table_index(linear: u32) -> usize {
    ((linear >> PAGE_POWER) & 0x3FF) as usize
}

/// Page-aligned base of the page containing `linear`.
pub fn page_addr(linear: u32) -> u32 {
    linear & !(PAGE_SIZE as u32 - 1)
}

impl PageDirectory {
    /// The kernel directory: identity-map the physical frames, leaving
    /// page 0 unmapped so null dereferences trap.
    pub fn new_kernel(num_frames: usize) -> Self {
        let mut entries: Vec<PageDirEntry> = (0..NUM_PAGE_DIR_ENTRIES)
            .map(|_| PageDirEntry::default())
            .collect();

        let num_tables = num_frames.div_ceil(NUM_PAGE_TABLE_ENTRIES);
        for d in 0..num_tables {
            let mut table = PageTable::new();
            for t in 0..NUM_PAGE_TABLE_ENTRIES {
                let frame = d * NUM_PAGE_TABLE_ENTRIES + t;
                if frame >= num_frames {
                    break;
                }
                *table.entry_mut(t) = Pte {
                    present: true,
                    flags: PteFlags::kernel_rwx(),
                    page_base: frame as u32,
                    ..Pte::default()
                };
            }
            entries[d] = PageDirEntry {
                present: true,
                flags: PteFlags::kernel_rwx(),
                kernel: true,
                table: Some(table),
            };
        }
        // null-pointer guard
        if let Some(table) = entries[0].table.as_mut() {
            table.entry_mut(0).present = false;
        }

        Self { entries }
    }

    /// A fresh user directory with the kernel entries copied in, so
    /// kernel addresses stay valid whichever space is active. The
    /// copies are shared-identity markers, not duplicated tables.
    pub fn new_user(kernel_dir: &PageDirectory) -> Self {
        let entries = kernel_dir
            .entries
            .iter()
            .map(|e| {
                if e.present && e.kernel {
                    PageDirEntry {
                        present: true,
                        flags: e.flags,
                        kernel: true,
                        table: None,
                    }
                } else {
                    PageDirEntry::default()
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entry(&self, didx: usize) -> &PageDirEntry {
        &self.entries[didx]
    }

    pub fn table_present(&self, linear: u32) -> bool {
        let e = &self.entries[dir_index(linear)];
        e.present && e.table.is_some()
    }

    /// Resolve the PTE for a linear address through a user-owned table.
    pub fn pte(&self, linear: u32) -> Option<&Pte> {
        let e = &self.entries[dir_index(linear)];
        if !e.present {
            return None;
        }
        e.table.as_ref().map(|t| t.entry(table_index(linear)))
    }

    pub fn pte_mut(&mut self, linear: u32) -> Option<&mut Pte> {
        let e = &mut self.entries[dir_index(linear)];
        if !e.present {
            return None;
        }
        e.table.as_mut().map(|t| t.entry_mut(table_index(linear)))
    }

    /// Install a zeroed user page table at the directory slot covering
    /// `linear` if none is there, and return the covered PTE.
    pub fn ensure_table(&mut self, linear: u32) -> &mut Pte {
        let e = &mut self.entries[dir_index(linear)];
        if !e.present {
            log::debug!(
                "allocating new page table at directory index {}",
                dir_index(linear)
            );
            *e = PageDirEntry {
                present: true,
                flags: PteFlags::user_rwx(),
                kernel: false,
                table: Some(PageTable::new()),
            };
        }
        e.table
            .as_mut()
            .expect("kernel directory entry in user ensure_table")
            .entry_mut(table_index(linear))
    }

    /// Iterate the user-owned tables with their directory indices.
    pub fn user_tables(&self) -> impl Iterator<Item = (usize, &PageTable)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present && !e.kernel)
            .filter_map(|(d, e)| e.table.as_ref().map(|t| (d, t)))
    }

    pub fn user_tables_mut(&mut self) -> impl Iterator<Item = (usize, &mut PageTable)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter(|(_, e)| e.present && !e.kernel)
            .filter_map(|(d, e)| e.table.as_mut().map(|t| (d, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_split() {
        let linear = 0x8040_3123u32;
        assert_eq!(dir_index(linear), 0x201);
        assert_eq!(table_index(linear), 0x3);
        assert_eq!(page_addr(linear), 0x8040_3000);
    }

    #[test]
    fn test_kernel_dir_identity_with_null_guard() {
        let dir = PageDirectory::new_kernel(8);
        let pte = dir.pte(0).unwrap();
        assert!(!pte.present, "page 0 must trap");
        let pte = dir.pte(PAGE_SIZE as u32 * 3).unwrap();
        assert!(pte.present);
        assert_eq!(pte.page_base, 3);
        assert!(!pte.flags.contains(PteFlags::USER));
    }

    #[test]
    fn test_user_dir_shares_kernel_entries() {
        let kdir = PageDirectory::new_kernel(8);
        let udir = PageDirectory::new_user(&kdir);
        assert!(udir.entry(0).present);
        assert!(udir.entry(0).kernel);
        assert!(udir.entry(0).table.is_none());
        // user region starts empty
        assert!(udir.pte(0x8000_0000).is_none());
    }

    #[test]
    fn test_ensure_table_installs_user_flags() {
        let kdir = PageDirectory::new_kernel(4);
        let mut udir = PageDirectory::new_user(&kdir);
        let linear = 0x8000_0000u32 + PAGE_SIZE as u32;
        assert!(!udir.table_present(linear));
        let pte = udir.ensure_table(linear);
        assert!(!pte.present);
        assert!(udir.table_present(linear));
        assert!(udir.entry(dir_index(linear)).flags.contains(PteFlags::USER));
    }
}
