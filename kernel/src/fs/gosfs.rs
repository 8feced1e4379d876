//! GOSFS, the on-disk inode filesystem
//!
//! Layout: the superblock starts at block 0 and may span several
//! blocks; it embeds the whole inode table and the block-allocation
//! bitmap. Inode 0 is the root directory. Every on-disk scalar is
//! little-endian and 8 bytes wide except the 32-bit magic heading the
//! superblock.
//!
//! An inode addresses its data through 8 direct pointers, one
//! single-indirect block and one double-indirect block. Directories
//! are packed arrays of fixed-size entries in their data blocks.
//!
//! All operations on an instance serialize on its mutex; the in-memory
//! superblock reaches disk only on an explicit sync.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::blockdev::SharedDisk;
use super::bufcache::FsBufferCache;
use super::file::{DirSnapshot, File, FileBody, GosFileEntry, OpenMode};
use super::{AclEntry, FileStat, FilesystemOps, MountPointOps, VfsDirEntry, VFS_MAX_ACL_ENTRIES};
use crate::config::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;

pub const GOSFS_MAGIC: u32 = 0x0DEA_DB05;

pub const GOSFS_NUM_INODES: usize = 1024;

/// Disk sectors per filesystem block.
pub const GOSFS_SECTORS_PER_FS_BLOCK: usize = 8;

/// Size of a filesystem block in bytes.
pub const GOSFS_FS_BLOCK_SIZE: usize = GOSFS_SECTORS_PER_FS_BLOCK * SECTOR_SIZE;

pub const GOSFS_FILENAME_MAX: usize = 127;

pub const GOSFS_NUM_DIRECT_BLOCKS: usize = 8;
pub const GOSFS_NUM_INDIRECT_BLOCKS: usize = 1;
pub const GOSFS_NUM_2X_INDIRECT_BLOCKS: usize = 1;

/// Total block pointers in an inode.
pub const GOSFS_NUM_BLOCK_PTRS: usize =
    GOSFS_NUM_DIRECT_BLOCKS + GOSFS_NUM_INDIRECT_BLOCKS + GOSFS_NUM_2X_INDIRECT_BLOCKS;

/// Block pointers that fit in one filesystem block.
pub const GOSFS_PTRS_PER_BLOCK: usize = GOSFS_FS_BLOCK_SIZE / 8;

/// Directory entries that fit in one filesystem block.
pub const GOSFS_DIR_ENTRIES_PER_BLOCK: usize = GOSFS_FS_BLOCK_SIZE / DIR_ENTRY_DISK_SIZE;

/// Largest file, in blocks: direct + single + double indirection.
pub const GOSFS_MAX_FILE_BLOCKS: u64 = GOSFS_NUM_DIRECT_BLOCKS as u64
    + (GOSFS_NUM_INDIRECT_BLOCKS * GOSFS_PTRS_PER_BLOCK) as u64
    + (GOSFS_NUM_2X_INDIRECT_BLOCKS * GOSFS_PTRS_PER_BLOCK * GOSFS_PTRS_PER_BLOCK) as u64;

const INODE_DISK_SIZE: usize = 7 * 8 + GOSFS_NUM_BLOCK_PTRS * 8 + VFS_MAX_ACL_ENTRIES * 8;
const DIR_ENTRY_DISK_SIZE: usize = 8 + 8 + (GOSFS_FILENAME_MAX + 1);
const SUPERBLOCK_HEADER_SIZE: usize = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u64 {
        const USED      = 1 << 0;
        const DIRECTORY = 1 << 1;
        const SETUID    = 1 << 2;
    }
}

/// On-disk directory entry type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryType {
    Regular,
    This,
    Parent,
    Free,
}

impl DirEntryType {
    fn to_raw(self) -> u64 {
        match self {
            Self::Regular => 0,
            Self::This => 1,
            Self::Parent => 2,
            Self::Free => u64::MAX,
        }
    }

    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Regular,
            1 => Self::This,
            2 => Self::Parent,
            _ => Self::Free,
        }
    }
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u64(buf: &mut [u8], at: usize, val: u64) {
    buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

/// An inode. `size` counts bytes for files and live directory entries
/// for directories.
#[derive(Debug, Clone)]
pub struct Inode {
    pub size: u64,
    pub link_count: u64,
    pub blocks_used: u64,
    pub flags: InodeFlags,
    pub time_access: u64,
    pub time_modified: u64,
    pub time_inode: u64,
    pub block_list: [u64; GOSFS_NUM_BLOCK_PTRS],
    pub acl: [AclEntry; VFS_MAX_ACL_ENTRIES],
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            size: 0,
            link_count: 0,
            blocks_used: 0,
            flags: InodeFlags::empty(),
            time_access: 0,
            time_modified: 0,
            time_inode: 0,
            block_list: [0; GOSFS_NUM_BLOCK_PTRS],
            acl: [AclEntry::default(); VFS_MAX_ACL_ENTRIES],
        }
    }
}

impl Inode {
    pub fn is_used(&self) -> bool {
        self.flags.contains(InodeFlags::USED)
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(InodeFlags::DIRECTORY)
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), INODE_DISK_SIZE);
        put_u64(buf, 0, self.size);
        put_u64(buf, 8, self.link_count);
        put_u64(buf, 16, self.blocks_used);
        put_u64(buf, 24, self.flags.bits());
        put_u64(buf, 32, self.time_access);
        put_u64(buf, 40, self.time_modified);
        put_u64(buf, 48, self.time_inode);
        for (i, ptr) in self.block_list.iter().enumerate() {
            put_u64(buf, 56 + i * 8, *ptr);
        }
        let acl_base = 56 + GOSFS_NUM_BLOCK_PTRS * 8;
        for (i, entry) in self.acl.iter().enumerate() {
            buf[acl_base + i * 8..acl_base + i * 8 + 4].copy_from_slice(&entry.uid.to_le_bytes());
            buf[acl_base + i * 8 + 4..acl_base + i * 8 + 8]
                .copy_from_slice(&entry.permission.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), INODE_DISK_SIZE);
        let mut inode = Inode {
            size: get_u64(buf, 0),
            link_count: get_u64(buf, 8),
            blocks_used: get_u64(buf, 16),
            flags: InodeFlags::from_bits_truncate(get_u64(buf, 24)),
            time_access: get_u64(buf, 32),
            time_modified: get_u64(buf, 40),
            time_inode: get_u64(buf, 48),
            ..Inode::default()
        };
        for i in 0..GOSFS_NUM_BLOCK_PTRS {
            inode.block_list[i] = get_u64(buf, 56 + i * 8);
        }
        let acl_base = 56 + GOSFS_NUM_BLOCK_PTRS * 8;
        for i in 0..VFS_MAX_ACL_ENTRIES {
            let at = acl_base + i * 8;
            let mut word = [0u8; 4];
            word.copy_from_slice(&buf[at..at + 4]);
            inode.acl[i].uid = u32::from_le_bytes(word);
            word.copy_from_slice(&buf[at + 4..at + 8]);
            inode.acl[i].permission = u32::from_le_bytes(word);
        }
        inode
    }

    fn stat(&self) -> FileStat {
        FileStat {
            size: self.size,
            is_directory: self.is_directory(),
            is_setuid: self.flags.contains(InodeFlags::SETUID),
            acls: self.acl,
        }
    }
}

/// One on-disk directory entry.
#[derive(Debug, Clone)]
struct DiskDirEntry {
    entry_type: DirEntryType,
    inode: u64,
    filename: String,
}

impl DiskDirEntry {
    fn free() -> Self {
        Self {
            entry_type: DirEntryType::Free,
            inode: 0,
            filename: String::new(),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), DIR_ENTRY_DISK_SIZE);
        put_u64(buf, 0, self.entry_type.to_raw());
        put_u64(buf, 8, self.inode);
        buf[16..].fill(0);
        let name = self.filename.as_bytes();
        debug_assert!(name.len() <= GOSFS_FILENAME_MAX);
        buf[16..16 + name.len()].copy_from_slice(name);
    }

    fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), DIR_ENTRY_DISK_SIZE);
        let name_bytes = &buf[16..];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(0);
        Self {
            entry_type: DirEntryType::from_raw(get_u64(buf, 0)),
            inode: get_u64(buf, 8),
            filename: String::from_utf8_lossy(&name_bytes[..end]).to_string(),
        }
    }
}

/// The in-memory superblock, covering the whole volume's metadata.
#[derive(Debug)]
pub struct Superblock {
    pub magic: u32,
    /// Superblock byte size, bitmap included.
    pub supersize: u64,
    /// Total filesystem blocks on the volume.
    pub size: u64,
    pub inodes: Vec<Inode>,
    pub bitmap: crate::util::Bitmap,
}

impl Superblock {
    fn new(num_blocks: u64) -> Self {
        let bitmap = crate::util::Bitmap::new(num_blocks as usize);
        let supersize = (SUPERBLOCK_HEADER_SIZE
            + GOSFS_NUM_INODES * INODE_DISK_SIZE
            + bitmap.byte_len()) as u64;
        Self {
            magic: GOSFS_MAGIC,
            supersize,
            size: num_blocks,
            inodes: vec![Inode::default(); GOSFS_NUM_INODES],
            bitmap,
        }
    }

    /// Blocks the superblock occupies on disk.
    fn block_span(&self) -> u64 {
        self.supersize.div_ceil(GOSFS_FS_BLOCK_SIZE as u64)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.supersize as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        put_u64(&mut buf, 8, self.supersize);
        put_u64(&mut buf, 16, self.size);
        for (i, inode) in self.inodes.iter().enumerate() {
            let at = SUPERBLOCK_HEADER_SIZE + i * INODE_DISK_SIZE;
            inode.encode(&mut buf[at..at + INODE_DISK_SIZE]);
        }
        let bitmap_at = SUPERBLOCK_HEADER_SIZE + GOSFS_NUM_INODES * INODE_DISK_SIZE;
        buf[bitmap_at..bitmap_at + self.bitmap.byte_len()].copy_from_slice(self.bitmap.as_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> KernelResult<Self> {
        if buf.len() < SUPERBLOCK_HEADER_SIZE {
            return Err(KernelError::FsGen);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let magic = u32::from_le_bytes(magic);
        if magic != GOSFS_MAGIC {
            return Err(KernelError::FsGen);
        }
        let supersize = get_u64(buf, 8);
        let size = get_u64(buf, 16);
        if (buf.len() as u64) < supersize {
            return Err(KernelError::FsGen);
        }
        let mut inodes = Vec::with_capacity(GOSFS_NUM_INODES);
        for i in 0..GOSFS_NUM_INODES {
            let at = SUPERBLOCK_HEADER_SIZE + i * INODE_DISK_SIZE;
            inodes.push(Inode::decode(&buf[at..at + INODE_DISK_SIZE]));
        }
        let bitmap_at = SUPERBLOCK_HEADER_SIZE + GOSFS_NUM_INODES * INODE_DISK_SIZE;
        let bitmap = crate::util::Bitmap::from_bytes(&buf[bitmap_at..], size as usize);
        Ok(Self {
            magic,
            supersize,
            size,
            inodes,
            bitmap,
        })
    }
}

#[derive(Debug)]
struct GosfsInner {
    superblock: Superblock,
    cache: FsBufferCache,
}

/// A mounted GOSFS instance. The mutex serializes every operation;
/// buffer-cache waits may occur while it is held.
#[derive(Debug)]
pub struct Gosfs {
    inner: Mutex<GosfsInner>,
}

// ===========================================================================
// Core (under the instance lock)
// ===========================================================================

impl GosfsInner {
    fn find_free_inode(&self) -> KernelResult<u32> {
        // inode 0 is the root and always in use after format
        self.superblock
            .inodes
            .iter()
            .position(|inode| inode.flags.is_empty())
            .map(|i| i as u32)
            .ok_or(KernelError::FsGen)
    }

    /// Allocate a zero-filled block, first fit in the bitmap.
    fn alloc_block(&mut self, exec: &mut Exec) -> KernelResult<u64> {
        let block = self
            .superblock
            .bitmap
            .find_first_clear()
            .ok_or(KernelError::NoSpace)? as u64;
        let h = self.cache.get(block, exec)?;
        self.cache.data_mut(h).fill(0);
        self.cache.modify(h);
        self.cache.release(h, exec);
        self.superblock.bitmap.set(block as usize);
        log::debug!("gosfs: allocated block {}", block);
        Ok(block)
    }

    fn read_ptr(&mut self, block: u64, idx: usize, exec: &mut Exec) -> KernelResult<u64> {
        let h = self.cache.get(block, exec)?;
        let val = get_u64(self.cache.data(h), idx * 8);
        self.cache.release(h, exec);
        Ok(val)
    }

    fn write_ptr(&mut self, block: u64, idx: usize, val: u64, exec: &mut Exec) -> KernelResult<()> {
        let h = self.cache.get(block, exec)?;
        put_u64(self.cache.data_mut(h), idx * 8, val);
        self.cache.modify(h);
        self.cache.release(h, exec);
        Ok(())
    }

    /// Resolve a logical file block to its physical block, if mapped.
    /// Level 0 is direct, level 1 goes through the indirect block,
    /// level 2 through the double-indirect chain; anything past that
    /// is beyond the maximum file size.
    fn physical_block(
        &mut self,
        inode_idx: u32,
        lblock: u64,
        exec: &mut Exec,
    ) -> KernelResult<Option<u64>> {
        let d = GOSFS_NUM_DIRECT_BLOCKS as u64;
        let p = GOSFS_PTRS_PER_BLOCK as u64;
        let block_list = self.superblock.inodes[inode_idx as usize].block_list;

        let phys = if lblock < d {
            block_list[lblock as usize]
        } else if lblock < d + p {
            let ind = block_list[GOSFS_NUM_DIRECT_BLOCKS];
            if ind == 0 {
                return Ok(None);
            }
            self.read_ptr(ind, (lblock - d) as usize, exec)?
        } else if lblock < GOSFS_MAX_FILE_BLOCKS {
            let top = block_list[GOSFS_NUM_DIRECT_BLOCKS + GOSFS_NUM_INDIRECT_BLOCKS];
            if top == 0 {
                return Ok(None);
            }
            let k = lblock - d - p;
            let mid = self.read_ptr(top, (k / p) as usize, exec)?;
            if mid == 0 {
                return Ok(None);
            }
            self.read_ptr(mid, (k % p) as usize, exec)?
        } else {
            return Err(KernelError::MaxSize);
        };
        Ok((phys != 0).then_some(phys))
    }

    /// Allocate the data block for logical block `lblock`, creating
    /// missing indirect blocks on the way.
    fn create_file_block(
        &mut self,
        inode_idx: u32,
        lblock: u64,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let d = GOSFS_NUM_DIRECT_BLOCKS as u64;
        let p = GOSFS_PTRS_PER_BLOCK as u64;
        if lblock >= GOSFS_MAX_FILE_BLOCKS {
            log::debug!("gosfs: maximum file size reached at block {}", lblock);
            return Err(KernelError::MaxSize);
        }
        let data = self.alloc_block(exec)?;

        if lblock < d {
            self.superblock.inodes[inode_idx as usize].block_list[lblock as usize] = data;
        } else if lblock < d + p {
            let at = GOSFS_NUM_DIRECT_BLOCKS;
            let mut ind = self.superblock.inodes[inode_idx as usize].block_list[at];
            if ind == 0 {
                ind = self.alloc_block(exec)?;
                self.superblock.inodes[inode_idx as usize].block_list[at] = ind;
            }
            self.write_ptr(ind, (lblock - d) as usize, data, exec)?;
        } else {
            let at = GOSFS_NUM_DIRECT_BLOCKS + GOSFS_NUM_INDIRECT_BLOCKS;
            let mut top = self.superblock.inodes[inode_idx as usize].block_list[at];
            if top == 0 {
                top = self.alloc_block(exec)?;
                self.superblock.inodes[inode_idx as usize].block_list[at] = top;
            }
            let k = lblock - d - p;
            let mut mid = self.read_ptr(top, (k / p) as usize, exec)?;
            if mid == 0 {
                mid = self.alloc_block(exec)?;
                self.write_ptr(top, (k / p) as usize, mid, exec)?;
            }
            self.write_ptr(mid, (k % p) as usize, data, exec)?;
        }

        self.superblock.inodes[inode_idx as usize].blocks_used += 1;
        Ok(())
    }

    /// Scan one directory block for the first entry satisfying `pred`.
    fn scan_block(
        &mut self,
        block: u64,
        exec: &mut Exec,
        pred: impl Fn(&DiskDirEntry) -> bool,
    ) -> KernelResult<Option<(usize, DiskDirEntry)>> {
        let h = self.cache.get(block, exec)?;
        let mut found = None;
        for e in 0..GOSFS_DIR_ENTRIES_PER_BLOCK {
            let at = e * DIR_ENTRY_DISK_SIZE;
            let entry = DiskDirEntry::decode(&self.cache.data(h)[at..at + DIR_ENTRY_DISK_SIZE]);
            if pred(&entry) {
                found = Some((e, entry));
                break;
            }
        }
        self.cache.release(h, exec);
        Ok(found)
    }

    fn write_entry_at(
        &mut self,
        block: u64,
        slot: usize,
        entry: &DiskDirEntry,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let h = self.cache.get(block, exec)?;
        let at = slot * DIR_ENTRY_DISK_SIZE;
        entry.encode(&mut self.cache.data_mut(h)[at..at + DIR_ENTRY_DISK_SIZE]);
        self.cache.modify(h);
        self.cache.release(h, exec);
        Ok(())
    }

    /// Add a directory entry to `parent`, using the first free slot in
    /// its existing directory blocks.
    fn add_dir_entry(
        &mut self,
        parent: u32,
        entry: DiskDirEntry,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let block_list = self.superblock.inodes[parent as usize].block_list;
        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            if let Some((slot, _)) =
                self.scan_block(block, exec, |e| e.entry_type == DirEntryType::Free)?
            {
                self.write_entry_at(block, slot, &entry, exec)?;
                self.superblock.inodes[parent as usize].size += 1;
                return Ok(());
            }
        }
        // TODO: allocate a fresh directory block through an unused
        // direct pointer once every existing block is full; until then
        // a directory is capped at GOSFS_NUM_DIRECT_BLOCKS blocks of
        // entries.
        log::debug!("gosfs: no free directory slot in inode {}", parent);
        Err(KernelError::NoSpace)
    }

    /// Clear the entry referencing `inode` out of `parent`.
    fn remove_dir_entry(&mut self, parent: u32, inode: u64, exec: &mut Exec) -> KernelResult<()> {
        let block_list = self.superblock.inodes[parent as usize].block_list;
        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            let hit = self.scan_block(block, exec, |e| {
                e.entry_type != DirEntryType::Free && e.inode == inode
            })?;
            if let Some((slot, _)) = hit {
                self.write_entry_at(block, slot, &DiskDirEntry::free(), exec)?;
                self.superblock.inodes[parent as usize].size -= 1;
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    fn find_in_directory(
        &mut self,
        dir_inode: u32,
        name: &str,
        exec: &mut Exec,
    ) -> KernelResult<Option<u32>> {
        let block_list = self.superblock.inodes[dir_inode as usize].block_list;
        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            let hit = self.scan_block(block, exec, |e| {
                e.entry_type != DirEntryType::Free && e.filename == name
            })?;
            if let Some((_, entry)) = hit {
                return Ok(Some(entry.inode as u32));
            }
        }
        Ok(None)
    }

    /// Walk a path from the root, one component per directory scan.
    fn find_inode_by_name(&mut self, path: &str, exec: &mut Exec) -> KernelResult<u32> {
        if path.is_empty() || path == "/" {
            return Ok(0);
        }
        if !path.starts_with('/') {
            return Err(KernelError::Invalid);
        }
        let mut inode = 0u32;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if component.len() > GOSFS_FILENAME_MAX {
                return Err(KernelError::NameTooLong);
            }
            if !self.superblock.inodes[inode as usize].is_directory() {
                return Err(KernelError::NotFound);
            }
            inode = self
                .find_in_directory(inode, component, exec)?
                .ok_or(KernelError::NotFound)?;
        }
        Ok(inode)
    }

    /// Split `path` into its parent's inode and the final component.
    fn resolve_parent<'p>(
        &mut self,
        path: &'p str,
        exec: &mut Exec,
    ) -> KernelResult<(u32, &'p str)> {
        let cut = path.rfind('/').ok_or(KernelError::Invalid)?;
        let (parent_path, name) = (&path[..cut], &path[cut + 1..]);
        if name.is_empty() {
            return Err(KernelError::Invalid);
        }
        if name.len() > GOSFS_FILENAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        let parent = self.find_inode_by_name(parent_path, exec)?;
        if !self.superblock.inodes[parent as usize].is_directory() {
            return Err(KernelError::NotDir);
        }
        Ok((parent, name))
    }

    /// True when `inode` holds no regular entries (`.` and `..` do not
    /// count). Non-directories are trivially empty.
    fn is_directory_empty(&mut self, inode_idx: u32, exec: &mut Exec) -> KernelResult<bool> {
        if !self.superblock.inodes[inode_idx as usize].is_directory() {
            return Ok(true);
        }
        let block_list = self.superblock.inodes[inode_idx as usize].block_list;
        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            let hit =
                self.scan_block(block, exec, |e| e.entry_type == DirEntryType::Regular)?;
            if hit.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fill a fresh directory block: `.`, `..`, rest free.
    fn write_first_directory_block(
        &mut self,
        block: u64,
        this_inode: u64,
        parent_inode: u64,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let h = self.cache.get(block, exec)?;
        for e in 0..GOSFS_DIR_ENTRIES_PER_BLOCK {
            let entry = match e {
                0 => DiskDirEntry {
                    entry_type: DirEntryType::This,
                    inode: this_inode,
                    filename: ".".to_string(),
                },
                1 => DiskDirEntry {
                    entry_type: DirEntryType::Parent,
                    inode: parent_inode,
                    filename: "..".to_string(),
                },
                _ => DiskDirEntry::free(),
            };
            let at = e * DIR_ENTRY_DISK_SIZE;
            entry.encode(&mut self.cache.data_mut(h)[at..at + DIR_ENTRY_DISK_SIZE]);
        }
        self.cache.modify(h);
        self.cache.release(h, exec);
        Ok(())
    }

    /// Create a file inode under `parent` and link it in.
    fn create_file_inode(
        &mut self,
        parent: u32,
        name: &str,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<u32> {
        let inode_idx = self.find_free_inode()?;
        {
            let inode = &mut self.superblock.inodes[inode_idx as usize];
            *inode = Inode::default();
            inode.link_count = 1;
            inode.flags = InodeFlags::USED;
            inode.acl[0] = AclEntry {
                uid: euid,
                permission: (OpenMode::READ | OpenMode::WRITE).bits(),
            };
            inode.time_inode = exec.now;
            inode.time_modified = exec.now;
        }
        let linked = self.add_dir_entry(
            parent,
            DiskDirEntry {
                entry_type: DirEntryType::Regular,
                inode: inode_idx as u64,
                filename: name.to_string(),
            },
            exec,
        );
        if let Err(e) = linked {
            self.superblock.inodes[inode_idx as usize] = Inode::default();
            return Err(e);
        }
        Ok(inode_idx)
    }

    /// Release every data and indirect block the inode owns.
    fn free_inode_blocks(&mut self, inode_idx: u32, exec: &mut Exec) -> KernelResult<()> {
        let block_list = self.superblock.inodes[inode_idx as usize].block_list;

        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block != 0 {
                self.superblock.bitmap.clear(block as usize);
            }
        }

        let ind = block_list[GOSFS_NUM_DIRECT_BLOCKS];
        if ind != 0 {
            for e in 0..GOSFS_PTRS_PER_BLOCK {
                let data = self.read_ptr(ind, e, exec)?;
                if data != 0 {
                    self.superblock.bitmap.clear(data as usize);
                }
            }
            self.superblock.bitmap.clear(ind as usize);
        }

        let top = block_list[GOSFS_NUM_DIRECT_BLOCKS + GOSFS_NUM_INDIRECT_BLOCKS];
        if top != 0 {
            for outer in 0..GOSFS_PTRS_PER_BLOCK {
                let mid = self.read_ptr(top, outer, exec)?;
                if mid == 0 {
                    continue;
                }
                for inner in 0..GOSFS_PTRS_PER_BLOCK {
                    let data = self.read_ptr(mid, inner, exec)?;
                    if data != 0 {
                        self.superblock.bitmap.clear(data as usize);
                    }
                }
                self.superblock.bitmap.clear(mid as usize);
            }
            self.superblock.bitmap.clear(top as usize);
        }
        Ok(())
    }

    /// Serialize the superblock into its blocks; dirty buffers only,
    /// the device is touched by the cache sync that follows.
    fn write_superblock(&mut self, exec: &mut Exec) -> KernelResult<()> {
        let bytes = self.superblock.encode();
        let span = self.superblock.block_span();
        for block in 0..span {
            let h = self.cache.get(block, exec)?;
            let at = (block as usize) * GOSFS_FS_BLOCK_SIZE;
            let n = core::cmp::min(GOSFS_FS_BLOCK_SIZE, bytes.len() - at);
            self.cache.data_mut(h)[..n].copy_from_slice(&bytes[at..at + n]);
            self.cache.modify(h);
            self.cache.release(h, exec);
        }
        Ok(())
    }
}

// ===========================================================================
// Public operations
// ===========================================================================

impl Gosfs {
    /// Write a fresh filesystem to `dev`: magic, empty inode table,
    /// clear bitmap, and inode 0 as the root directory with `.` and
    /// `..` both pointing at itself.
    pub fn format(dev: &SharedDisk, cache_size: usize, exec: &mut Exec) -> KernelResult<()> {
        let num_blocks = dev.lock().num_sectors() / GOSFS_SECTORS_PER_FS_BLOCK as u64;
        let mut superblock = Superblock::new(num_blocks);
        let span = superblock.block_span();
        if span + 1 > num_blocks {
            return Err(KernelError::NoSpace);
        }
        for block in 0..span {
            superblock.bitmap.set(block as usize);
        }

        let root_block = span;
        superblock.bitmap.set(root_block as usize);
        let root = &mut superblock.inodes[0];
        root.flags = InodeFlags::USED | InodeFlags::DIRECTORY;
        root.size = 2;
        root.link_count = 1;
        root.blocks_used = 1;
        root.block_list[0] = root_block;
        root.acl[0] = AclEntry {
            uid: 0,
            permission: (OpenMode::READ | OpenMode::WRITE).bits(),
        };
        root.time_inode = exec.now;

        let mut inner = GosfsInner {
            superblock,
            cache: FsBufferCache::new(dev.clone(), GOSFS_FS_BLOCK_SIZE, cache_size),
        };
        inner.write_first_directory_block(root_block, 0, 0, exec)?;
        inner.write_superblock(exec)?;
        inner.cache.sync()?;
        log::info!("gosfs: formatted {} blocks", num_blocks);
        Ok(())
    }

    /// Mount: verify the magic, pull the whole superblock into memory.
    pub fn mount(dev: &SharedDisk, cache_size: usize, exec: &mut Exec) -> KernelResult<Gosfs> {
        let mut cache = FsBufferCache::new(dev.clone(), GOSFS_FS_BLOCK_SIZE, cache_size);

        let h = cache.get(0, exec)?;
        let header = cache.data(h)[..SUPERBLOCK_HEADER_SIZE].to_vec();
        cache.release(h, exec);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        if u32::from_le_bytes(magic) != GOSFS_MAGIC {
            log::warn!("gosfs: bad magic, not a gosfs volume (format first?)");
            return Err(KernelError::FsGen);
        }
        let supersize = get_u64(&header, 8);
        let span = supersize.div_ceil(GOSFS_FS_BLOCK_SIZE as u64);

        let mut bytes = vec![0u8; (span as usize) * GOSFS_FS_BLOCK_SIZE];
        for block in 0..span {
            let h = cache.get(block, exec)?;
            let at = (block as usize) * GOSFS_FS_BLOCK_SIZE;
            bytes[at..at + GOSFS_FS_BLOCK_SIZE].copy_from_slice(cache.data(h));
            cache.release(h, exec);
        }
        let superblock = Superblock::decode(&bytes)?;
        log::info!(
            "gosfs: mounted, {} blocks, superblock {} bytes",
            superblock.size,
            superblock.supersize
        );
        Ok(Gosfs {
            inner: Mutex::new(GosfsInner { superblock, cache }),
        })
    }

    /// Open a file, creating it when `CREATE` is requested.
    pub fn open_file(
        this: &Arc<Gosfs>,
        path: &str,
        mode: OpenMode,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<File> {
        let inner = &mut *this.inner.lock();
        let inode_idx = match inner.find_inode_by_name(path, exec) {
            Ok(idx) => idx,
            Err(KernelError::NotFound) if mode.contains(OpenMode::CREATE) => {
                let (parent, name) = inner.resolve_parent(path, exec)?;
                inner.create_file_inode(parent, name, euid, exec)?
            }
            Err(e) => return Err(e),
        };
        let inode = &inner.superblock.inodes[inode_idx as usize];
        if inode.is_directory() {
            return Err(KernelError::NotFile);
        }
        let size = inode.size;
        Ok(File::new(
            FileBody::Gos(Arc::new(GosFileEntry {
                instance: this.clone(),
                inode: inode_idx,
            })),
            size,
            mode,
            None,
        ))
    }

    /// Create a directory, with its `.`/`..` block.
    pub fn create_directory(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        let inner = &mut *self.inner.lock();
        let (parent, name) = inner.resolve_parent(path, exec)?;
        if inner.find_in_directory(parent, name, exec)?.is_some() {
            return Err(KernelError::Exist);
        }

        let inode_idx = inner.find_free_inode()?;
        inner.add_dir_entry(
            parent,
            DiskDirEntry {
                entry_type: DirEntryType::Regular,
                inode: inode_idx as u64,
                filename: name.to_string(),
            },
            exec,
        )?;
        let first_block = match inner.alloc_block(exec) {
            Ok(block) => block,
            Err(e) => {
                // roll the link back out of the parent
                let _ = inner.remove_dir_entry(parent, inode_idx as u64, exec);
                return Err(e);
            }
        };
        inner.write_first_directory_block(first_block, inode_idx as u64, parent as u64, exec)?;

        let inode = &mut inner.superblock.inodes[inode_idx as usize];
        *inode = Inode::default();
        inode.flags = InodeFlags::USED | InodeFlags::DIRECTORY;
        inode.size = 2;
        inode.link_count = 1;
        inode.blocks_used = 1;
        inode.block_list[0] = first_block;
        inode.acl[0] = AclEntry {
            uid: euid,
            permission: (OpenMode::READ | OpenMode::WRITE).bits(),
        };
        inode.time_inode = exec.now;
        log::debug!("gosfs: created directory {} as inode {}", path, inode_idx);
        Ok(())
    }

    /// Open a directory: snapshot its live entries for a single-shot
    /// `read_entry` iteration.
    pub fn open_directory(&self, path: &str, exec: &mut Exec) -> KernelResult<File> {
        let inner = &mut *self.inner.lock();
        let inode_idx = inner.find_inode_by_name(path, exec)?;
        let inode = &inner.superblock.inodes[inode_idx as usize];
        if !inode.is_directory() {
            return Err(KernelError::NotDir);
        }
        let size = inode.size;
        let block_list = inode.block_list;

        let mut entries = Vec::new();
        for &block in block_list.iter().take(GOSFS_NUM_DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            let h = inner.cache.get(block, exec)?;
            for e in 0..GOSFS_DIR_ENTRIES_PER_BLOCK {
                let at = e * DIR_ENTRY_DISK_SIZE;
                let entry =
                    DiskDirEntry::decode(&inner.cache.data(h)[at..at + DIR_ENTRY_DISK_SIZE]);
                if entry.entry_type != DirEntryType::Free {
                    let target = &inner.superblock.inodes[entry.inode as usize];
                    entries.push(VfsDirEntry {
                        name: entry.filename,
                        stat: target.stat(),
                    });
                }
            }
            inner.cache.release(h, exec);
        }

        Ok(File::new(
            FileBody::Dir(DirSnapshot { entries }),
            size,
            OpenMode::READ,
            None,
        ))
    }

    pub fn stat(&self, path: &str, exec: &mut Exec) -> KernelResult<FileStat> {
        let inner = &mut *self.inner.lock();
        let inode_idx = inner.find_inode_by_name(path, exec)?;
        let inode = &inner.superblock.inodes[inode_idx as usize];
        if !inode.is_used() {
            return Err(KernelError::NotFound);
        }
        Ok(inode.stat())
    }

    pub fn stat_inode(&self, inode_idx: u32, exec: &mut Exec) -> KernelResult<FileStat> {
        let _ = exec;
        let inner = self.inner.lock();
        Ok(inner.superblock.inodes[inode_idx as usize].stat())
    }

    /// Delete a file or an empty directory.
    pub fn delete(&self, path: &str, exec: &mut Exec) -> KernelResult<()> {
        let inner = &mut *self.inner.lock();
        if path.is_empty() || path == "/" {
            return Err(KernelError::Access);
        }
        let inode_idx = inner.find_inode_by_name(path, exec)?;
        if !inner.is_directory_empty(inode_idx, exec)? {
            return Err(KernelError::DirNotEmpty);
        }
        let (parent, _) = inner.resolve_parent(path, exec)?;
        inner.free_inode_blocks(inode_idx, exec)?;
        inner.superblock.inodes[inode_idx as usize] = Inode::default();
        inner.remove_dir_entry(parent, inode_idx as u64, exec)?;
        log::debug!("gosfs: deleted {} (inode {})", path, inode_idx);
        Ok(())
    }

    /// Flush the in-memory superblock and every dirty buffer.
    pub fn sync(&self, exec: &mut Exec) -> KernelResult<()> {
        let inner = &mut *self.inner.lock();
        inner.write_superblock(exec)?;
        inner.cache.sync()
    }

    pub fn set_acl(
        &self,
        path: &str,
        uid: u32,
        perms: u32,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let inner = &mut *self.inner.lock();
        let inode_idx = inner.find_inode_by_name(path, exec)?;
        let inode = &mut inner.superblock.inodes[inode_idx as usize];
        if euid != 0 && inode.acl[0].uid != euid {
            return Err(KernelError::Access);
        }
        if inode.acl[0].uid == uid {
            inode.acl[0].permission = perms;
            return Ok(());
        }
        // update in place, or claim the first unused slot
        if let Some(entry) = inode.acl[1..].iter_mut().find(|e| e.uid == uid && e.permission != 0) {
            entry.permission = perms;
            return Ok(());
        }
        match inode.acl[1..].iter_mut().find(|e| e.permission == 0) {
            Some(entry) => {
                entry.uid = uid;
                entry.permission = perms;
                Ok(())
            }
            None => Err(KernelError::AclMaxEntries),
        }
    }

    pub fn set_setuid(&self, path: &str, flag: bool, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        let inner = &mut *self.inner.lock();
        let inode_idx = inner.find_inode_by_name(path, exec)?;
        let inode = &mut inner.superblock.inodes[inode_idx as usize];
        if euid != 0 && inode.acl[0].uid != euid {
            return Err(KernelError::Access);
        }
        inode.flags.set(InodeFlags::SETUID, flag);
        Ok(())
    }

    /// Read from `pos`, clamped to `end_pos`. Every touched logical
    /// block must already be mapped.
    pub fn file_read(
        &self,
        inode_idx: u32,
        pos: u64,
        end_pos: u64,
        mode: OpenMode,
        buf: &mut [u8],
        exec: &mut Exec,
    ) -> KernelResult<usize> {
        let inner = &mut *self.inner.lock();
        if !mode.contains(OpenMode::READ) {
            return Err(KernelError::Access);
        }
        if pos >= end_pos || buf.is_empty() {
            return Ok(0);
        }
        let bs = GOSFS_FS_BLOCK_SIZE as u64;
        let n = core::cmp::min(buf.len() as u64, end_pos - pos) as usize;
        let start_block = pos / bs;
        let end_block = (pos + n as u64 - 1) / bs;

        let mut done = 0usize;
        for lblock in start_block..=end_block {
            let phys = inner
                .physical_block(inode_idx, lblock, exec)?
                .ok_or(KernelError::FsGen)?;
            let from = if lblock == start_block {
                (pos % bs) as usize
            } else {
                0
            };
            let take = core::cmp::min(GOSFS_FS_BLOCK_SIZE - from, n - done);
            let h = inner.cache.get(phys, exec)?;
            buf[done..done + take].copy_from_slice(&inner.cache.data(h)[from..from + take]);
            inner.cache.release(h, exec);
            done += take;
        }
        inner.superblock.inodes[inode_idx as usize].time_access = exec.now;
        Ok(done)
    }

    /// Write at `pos`, allocating missing blocks; returns the bytes
    /// written and the (possibly grown) file size.
    pub fn file_write(
        &self,
        inode_idx: u32,
        pos: u64,
        mode: OpenMode,
        buf: &[u8],
        exec: &mut Exec,
    ) -> KernelResult<(usize, u64)> {
        let inner = &mut *self.inner.lock();
        if !mode.contains(OpenMode::WRITE) {
            return Err(KernelError::Access);
        }
        if buf.is_empty() {
            return Ok((0, inner.superblock.inodes[inode_idx as usize].size));
        }
        let bs = GOSFS_FS_BLOCK_SIZE as u64;
        let start_block = pos / bs;
        let end_block = (pos + buf.len() as u64 - 1) / bs;

        let mut done = 0usize;
        for lblock in start_block..=end_block {
            if inner.physical_block(inode_idx, lblock, exec)?.is_none() {
                inner.create_file_block(inode_idx, lblock, exec)?;
            }
            let phys = inner
                .physical_block(inode_idx, lblock, exec)?
                .ok_or(KernelError::FsGen)?;
            let from = if lblock == start_block {
                (pos % bs) as usize
            } else {
                0
            };
            let take = core::cmp::min(GOSFS_FS_BLOCK_SIZE - from, buf.len() - done);
            let h = inner.cache.get(phys, exec)?;
            inner.cache.data_mut(h)[from..from + take].copy_from_slice(&buf[done..done + take]);
            inner.cache.modify(h);
            inner.cache.release(h, exec);
            done += take;
        }

        let inode = &mut inner.superblock.inodes[inode_idx as usize];
        if pos + done as u64 > inode.size {
            inode.size = pos + done as u64;
        }
        inode.time_modified = exec.now;
        Ok((done, inode.size))
    }

    /// Count of used blocks recorded for an inode (diagnostics/tests).
    pub fn blocks_used(&self, inode_idx: u32) -> u64 {
        self.inner.lock().superblock.inodes[inode_idx as usize].blocks_used
    }

    /// Free-block count from the allocation bitmap (diagnostics/tests).
    pub fn free_blocks(&self) -> u64 {
        let inner = self.inner.lock();
        inner.superblock.size - inner.superblock.bitmap.count_set() as u64
    }
}

// ===========================================================================
// VFS glue
// ===========================================================================

/// The mount-point object the VFS dispatches through.
pub struct GosfsHandle(pub Arc<Gosfs>);

impl MountPointOps for GosfsHandle {
    fn open(&self, path: &str, mode: OpenMode, euid: u32, exec: &mut Exec) -> KernelResult<File> {
        Gosfs::open_file(&self.0, path, mode, euid, exec)
    }

    fn create_directory(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        self.0.create_directory(path, euid, exec)
    }

    fn open_directory(&self, path: &str, exec: &mut Exec) -> KernelResult<File> {
        self.0.open_directory(path, exec)
    }

    fn stat(&self, path: &str, exec: &mut Exec) -> KernelResult<FileStat> {
        self.0.stat(path, exec)
    }

    fn sync(&self, exec: &mut Exec) -> KernelResult<()> {
        self.0.sync(exec)
    }

    fn delete(&self, path: &str, exec: &mut Exec) -> KernelResult<()> {
        self.0.delete(path, exec)
    }

    fn set_acl(
        &self,
        path: &str,
        uid: u32,
        perms: u32,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        self.0.set_acl(path, uid, perms, euid, exec)
    }

    fn set_setuid(&self, path: &str, flag: bool, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        self.0.set_setuid(path, flag, euid, exec)
    }

    fn name(&self) -> String {
        String::from("gosfs")
    }
}

/// The registry entry for the "gosfs" filesystem type.
pub struct GosfsFsOps {
    pub cache_size: usize,
}

impl FilesystemOps for GosfsFsOps {
    fn format(&self, dev: Option<&SharedDisk>, exec: &mut Exec) -> KernelResult<()> {
        let dev = dev.ok_or(KernelError::NoDev)?;
        Gosfs::format(dev, self.cache_size, exec)
    }

    fn mount(
        &self,
        dev: Option<&SharedDisk>,
        exec: &mut Exec,
    ) -> KernelResult<Box<dyn MountPointOps>> {
        let dev = dev.ok_or(KernelError::NoDev)?;
        let fs = Gosfs::mount(dev, self.cache_size, exec)?;
        Ok(Box::new(GosfsHandle(Arc::new(fs))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;
    use crate::sched::{SchedPolicy, Scheduler, ThreadTable, PRIORITY_NORMAL};
    use crate::sync::IntState;

    struct Rig {
        ints: IntState,
        sched: Scheduler,
        threads: ThreadTable,
        current: u32,
    }

    impl Rig {
        fn new() -> Self {
            let mut threads = ThreadTable::new();
            let current = threads.create(PRIORITY_NORMAL);
            Self {
                ints: IntState::new(),
                sched: Scheduler::new(SchedPolicy::RoundRobin, 4),
                threads,
                current,
            }
        }

        fn exec(&mut self) -> Exec<'_> {
            Exec {
                ints: &mut self.ints,
                sched: &mut self.sched,
                threads: &mut self.threads,
                current: self.current,
                now: 7,
            }
        }
    }

    /// A formatted, mounted 1024-block volume.
    fn fresh_fs(rig: &mut Rig) -> Arc<Gosfs> {
        let dev: SharedDisk = Arc::new(Mutex::new(RamDisk::new("ide0", 8192)));
        Gosfs::format(&dev, 16, &mut rig.exec()).unwrap();
        Arc::new(Gosfs::mount(&dev, 16, &mut rig.exec()).unwrap())
    }

    #[test]
    fn test_inode_codec_round_trip() {
        let mut inode = Inode::default();
        inode.size = 123456;
        inode.link_count = 1;
        inode.blocks_used = 31;
        inode.flags = InodeFlags::USED | InodeFlags::SETUID;
        inode.time_modified = 42;
        inode.block_list[0] = 99;
        inode.block_list[9] = 1234;
        inode.acl[0] = AclEntry {
            uid: 5,
            permission: 3,
        };
        let mut buf = [0u8; INODE_DISK_SIZE];
        inode.encode(&mut buf);
        let back = Inode::decode(&buf);
        assert_eq!(back.size, inode.size);
        assert_eq!(back.flags, inode.flags);
        assert_eq!(back.block_list, inode.block_list);
        assert_eq!(back.acl, inode.acl);
    }

    #[test]
    fn test_dir_entry_codec_round_trip() {
        let entry = DiskDirEntry {
            entry_type: DirEntryType::Regular,
            inode: 17,
            filename: "hello.txt".to_string(),
        };
        let mut buf = [0u8; DIR_ENTRY_DISK_SIZE];
        entry.encode(&mut buf);
        let back = DiskDirEntry::decode(&buf);
        assert_eq!(back.entry_type, DirEntryType::Regular);
        assert_eq!(back.inode, 17);
        assert_eq!(back.filename, "hello.txt");
    }

    #[test]
    fn test_format_mount_root_shape() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let stat = fs.stat("/", &mut rig.exec()).unwrap();
        assert!(stat.is_directory);
        assert!(stat.size >= 2, "root must hold . and ..");

        let mut dir = fs.open_directory("/", &mut rig.exec()).unwrap();
        let first = dir.read_entry().unwrap().unwrap();
        assert_eq!(first.name, ".");
        let second = dir.read_entry().unwrap().unwrap();
        assert_eq!(second.name, "..");
        assert!(dir.read_entry().unwrap().is_none());
    }

    #[test]
    fn test_mount_rejects_bad_magic() {
        let mut rig = Rig::new();
        let dev: SharedDisk = Arc::new(Mutex::new(RamDisk::new("ide0", 8192)));
        assert_eq!(
            Gosfs::mount(&dev, 8, &mut rig.exec()).err(),
            Some(KernelError::FsGen)
        );
    }

    #[test]
    fn test_write_then_read_back() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let file = Gosfs::open_file(
            &fs,
            "/notes",
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE,
            0,
            &mut rig.exec(),
        )
        .unwrap();
        drop(file);

        let payload = b"carved in stone";
        let (n, size) = {
            let entry_inode = {
                let mut inner = fs.inner.lock();
                inner.find_inode_by_name("/notes", &mut rig.exec()).unwrap()
            };
            fs.file_write(
                entry_inode,
                0,
                OpenMode::WRITE,
                payload,
                &mut rig.exec(),
            )
            .unwrap()
        };
        assert_eq!(n, payload.len());
        assert_eq!(size, payload.len() as u64);

        let stat = fs.stat("/notes", &mut rig.exec()).unwrap();
        assert_eq!(stat.size, payload.len() as u64);
    }

    #[test]
    fn test_open_missing_without_create() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        assert_eq!(
            Gosfs::open_file(&fs, "/ghost", OpenMode::READ, 0, &mut rig.exec())
                .err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn test_nested_directories_and_lookup() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        fs.create_directory("/a", 0, &mut rig.exec()).unwrap();
        fs.create_directory("/a/b", 0, &mut rig.exec()).unwrap();
        let file = Gosfs::open_file(
            &fs,
            "/a/b/c.txt",
            OpenMode::WRITE | OpenMode::CREATE,
            0,
            &mut rig.exec(),
        )
        .unwrap();
        drop(file);
        let stat = fs.stat("/a/b/c.txt", &mut rig.exec()).unwrap();
        assert!(!stat.is_directory);
        assert_eq!(
            fs.create_directory("/a/b", 0, &mut rig.exec()).err(),
            Some(KernelError::Exist)
        );
        assert_eq!(
            fs.stat("/a/x/c", &mut rig.exec()).err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn test_delete_restores_free_state() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let free_before = fs.free_blocks();
        fs.create_directory("/tmp", 0, &mut rig.exec()).unwrap();
        assert_eq!(fs.free_blocks(), free_before - 1);
        fs.delete("/tmp", &mut rig.exec()).unwrap();
        assert_eq!(fs.free_blocks(), free_before);
        assert_eq!(
            fs.stat("/tmp", &mut rig.exec()).err(),
            Some(KernelError::NotFound)
        );
        // root back to just . and ..
        assert_eq!(fs.stat("/", &mut rig.exec()).unwrap().size, 2);
    }

    #[test]
    fn test_delete_non_empty_directory_fails() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        fs.create_directory("/d", 0, &mut rig.exec()).unwrap();
        let file = Gosfs::open_file(&fs, "/d/f", OpenMode::WRITE | OpenMode::CREATE, 0, &mut rig.exec())
            .unwrap();
        drop(file);
        assert_eq!(
            fs.delete("/d", &mut rig.exec()).err(),
            Some(KernelError::DirNotEmpty)
        );
        fs.delete("/d/f", &mut rig.exec()).unwrap();
        fs.delete("/d", &mut rig.exec()).unwrap();
    }

    #[test]
    fn test_directory_entry_cap_is_enforced() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        fs.create_directory("/full", 0, &mut rig.exec()).unwrap();
        // one block of entries, minus . and ..
        let capacity = GOSFS_DIR_ENTRIES_PER_BLOCK - 2;
        for i in 0..capacity {
            let path = alloc::format!("/full/f{}", i);
            let f = Gosfs::open_file(&fs, &path, OpenMode::WRITE | OpenMode::CREATE, 0, &mut rig.exec())
                .unwrap();
            drop(f);
        }
        let overflow = Gosfs::open_file(
            &fs,
            "/full/straw",
            OpenMode::WRITE | OpenMode::CREATE,
            0,
            &mut rig.exec(),
        );
        assert_eq!(overflow.err(), Some(KernelError::NoSpace));
    }

    #[test]
    fn test_sparse_read_is_an_error_but_allocates_nothing() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let f = Gosfs::open_file(&fs, "/sparse", OpenMode::WRITE | OpenMode::CREATE, 0, &mut rig.exec())
            .unwrap();
        drop(f);
        let inode = {
            let mut inner = fs.inner.lock();
            inner.find_inode_by_name("/sparse", &mut rig.exec()).unwrap()
        };
        // write one byte far out: only the touched block plus indirect
        // plumbing is allocated
        let bs = GOSFS_FS_BLOCK_SIZE as u64;
        fs.file_write(inode, 10 * bs, OpenMode::WRITE, b"x", &mut rig.exec())
            .unwrap();
        let free_after = fs.free_blocks();
        // a hole in the middle reads as unmapped
        let mut buf = [0u8; 4];
        assert_eq!(
            fs.file_read(inode, 0, 10 * bs + 1, OpenMode::READ, &mut buf, &mut rig.exec())
                .err(),
            Some(KernelError::FsGen)
        );
        assert_eq!(fs.free_blocks(), free_after, "a failed read must not allocate");
    }

    #[test]
    fn test_indirect_block_accounting() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let f = Gosfs::open_file(&fs, "/big", OpenMode::WRITE | OpenMode::CREATE, 0, &mut rig.exec())
            .unwrap();
        drop(f);
        let inode = {
            let mut inner = fs.inner.lock();
            inner.find_inode_by_name("/big", &mut rig.exec()).unwrap()
        };
        let bs = GOSFS_FS_BLOCK_SIZE as u64;
        // one byte into logical block 9: past the 8 direct pointers,
        // into single-indirect territory
        fs.file_write(inode, 9 * bs, OpenMode::WRITE, b"y", &mut rig.exec())
            .unwrap();
        assert_eq!(fs.blocks_used(inode), 1, "only data blocks are counted");
        let mut buf = [0u8; 1];
        let n = fs
            .file_read(inode, 9 * bs, 9 * bs + 1, OpenMode::READ, &mut buf, &mut rig.exec())
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(&buf, b"y");
    }

    #[test]
    fn test_acl_storage() {
        let mut rig = Rig::new();
        let fs = fresh_fs(&mut rig);
        let f = Gosfs::open_file(&fs, "/owned", OpenMode::WRITE | OpenMode::CREATE, 5, &mut rig.exec())
            .unwrap();
        drop(f);
        let stat = fs.stat("/owned", &mut rig.exec()).unwrap();
        assert_eq!(stat.acls[0].uid, 5);

        // non-owner cannot touch the ACL
        assert_eq!(
            fs.set_acl("/owned", 9, 1, 6, &mut rig.exec()).err(),
            Some(KernelError::Access)
        );
        fs.set_acl("/owned", 9, 1, 5, &mut rig.exec()).unwrap();
        let stat = fs.stat("/owned", &mut rig.exec()).unwrap();
        assert!(stat.acls[1..].iter().any(|e| e.uid == 9 && e.permission == 1));

        fs.set_setuid("/owned", true, 5, &mut rig.exec()).unwrap();
        assert!(fs.stat("/owned", &mut rig.exec()).unwrap().is_setuid);
    }

    #[test]
    fn test_superblock_persists_only_on_sync() {
        let mut rig = Rig::new();
        let dev: SharedDisk = Arc::new(Mutex::new(RamDisk::new("ide0", 8192)));
        Gosfs::format(&dev, 16, &mut rig.exec()).unwrap();

        let fs = Arc::new(Gosfs::mount(&dev, 16, &mut rig.exec()).unwrap());
        fs.create_directory("/kept", 0, &mut rig.exec()).unwrap();

        // remount without sync: the directory was never written back
        let fs2 = Gosfs::mount(&dev, 16, &mut rig.exec()).unwrap();
        assert_eq!(
            fs2.stat("/kept", &mut rig.exec()).err(),
            Some(KernelError::NotFound)
        );

        fs.sync(&mut rig.exec()).unwrap();
        let fs3 = Gosfs::mount(&dev, 16, &mut rig.exec()).unwrap();
        assert!(fs3.stat("/kept", &mut rig.exec()).unwrap().is_directory);
    }
}
