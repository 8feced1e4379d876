//! Virtual filesystem layer
//!
//! A mount table maps short prefixes to mount points: `/c/sub/file`
//! selects the mount at prefix `c` and forwards `/sub/file` to its
//! operations. Filesystem types register format/mount entry points by
//! name; "gosfs" and "consfs" are registered at kernel init. ACL
//! checks happen here, on open, delete and stat, before the mount
//! point sees the request.

pub mod blockdev;
pub mod bufcache;
pub mod console;
pub mod file;
pub mod gosfs;
pub mod pipe;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use blockdev::{DeviceRegistry, SharedDisk};
use file::{File, OpenMode};

use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;

/// Fixed length of every access-control list.
pub const VFS_MAX_ACL_ENTRIES: usize = 10;

/// Longest path accepted from user space, NUL excluded.
pub const VFS_MAX_PATH_LEN: usize = 1024;

/// One `(uid, permission)` pair; entry 0 of a list is the owner. An
/// entry with zero permission bits is unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclEntry {
    pub uid: u32,
    pub permission: u32,
}

/// Metadata returned by stat/fstat.
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    /// Bytes for files, live entry count for directories.
    pub size: u64,
    pub is_directory: bool,
    pub is_setuid: bool,
    pub acls: [AclEntry; VFS_MAX_ACL_ENTRIES],
}

/// One directory entry as streamed by `read_entry`.
#[derive(Debug, Clone)]
pub struct VfsDirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// Operations of a mounted filesystem instance. Paths arrive with a
/// leading slash, relative to the mount.
pub trait MountPointOps {
    fn open(&self, path: &str, mode: OpenMode, euid: u32, exec: &mut Exec) -> KernelResult<File>;
    fn create_directory(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<()>;
    fn open_directory(&self, path: &str, exec: &mut Exec) -> KernelResult<File>;
    fn stat(&self, path: &str, exec: &mut Exec) -> KernelResult<FileStat>;
    fn sync(&self, exec: &mut Exec) -> KernelResult<()>;
    fn delete(&self, path: &str, exec: &mut Exec) -> KernelResult<()>;

    /// Install or update an ACL entry. Filesystems without ACL storage
    /// leave the default.
    fn set_acl(
        &self,
        _path: &str,
        _uid: u32,
        _perms: u32,
        _euid: u32,
        _exec: &mut Exec,
    ) -> KernelResult<()> {
        Err(KernelError::Unsupported)
    }

    /// Toggle the setuid flag.
    fn set_setuid(
        &self,
        _path: &str,
        _flag: bool,
        _euid: u32,
        _exec: &mut Exec,
    ) -> KernelResult<()> {
        Err(KernelError::Unsupported)
    }

    /// Filesystem type name, for diagnostics.
    fn name(&self) -> String;
}

/// A filesystem type as registered with the VFS.
pub trait FilesystemOps {
    fn format(&self, dev: Option<&SharedDisk>, exec: &mut Exec) -> KernelResult<()>;
    fn mount(
        &self,
        dev: Option<&SharedDisk>,
        exec: &mut Exec,
    ) -> KernelResult<Box<dyn MountPointOps>>;
}

/// ACL check: the owner (entry 0) is bounded by the owner permission
/// bits; anyone else is governed by the first non-zero entry matching
/// their uid, or denied. Uid 0 bypasses.
pub fn check_acl(stat: &FileStat, euid: u32, requested: OpenMode) -> KernelResult<()> {
    if euid == 0 {
        return Ok(());
    }
    let req = (requested & (OpenMode::READ | OpenMode::WRITE)).bits();
    let owner = stat.acls[0];
    if owner.uid == euid {
        if req & !owner.permission != 0 {
            return Err(KernelError::Access);
        }
        return Ok(());
    }
    for entry in &stat.acls[1..] {
        if entry.permission != 0 && entry.uid == euid {
            if req & !entry.permission != 0 {
                return Err(KernelError::Access);
            }
            return Ok(());
        }
    }
    Err(KernelError::Access)
}

/// A mounted filesystem.
pub struct MountPoint {
    pub prefix: String,
    pub ops: Box<dyn MountPointOps>,
    pub dev_name: Option<String>,
}

/// The mount table, filesystem-type registry, and device table.
pub struct Vfs {
    mounts: Vec<MountPoint>,
    fstypes: BTreeMap<String, Box<dyn FilesystemOps>>,
    pub devices: DeviceRegistry,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            fstypes: BTreeMap::new(),
            devices: DeviceRegistry::new(),
        }
    }

    pub fn register_filesystem(&mut self, name: &str, ops: Box<dyn FilesystemOps>) {
        let prev = self.fstypes.insert(name.to_string(), ops);
        assert!(prev.is_none(), "filesystem type registered twice");
    }

    /// Format the named device with the named filesystem type.
    pub fn format(&mut self, devname: &str, fstype: &str, exec: &mut Exec) -> KernelResult<()> {
        let fs = self.fstypes.get(fstype).ok_or(KernelError::NoFilesys)?;
        let dev = self.devices.get(devname)?;
        fs.format(Some(&dev), exec)
    }

    /// Mount `devname` under `prefix` with filesystem type `fstype`.
    /// The console filesystem takes no device; pass any name for it.
    pub fn mount(
        &mut self,
        devname: &str,
        prefix: &str,
        fstype: &str,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let prefix = prefix.trim_start_matches('/');
        if prefix.is_empty() || prefix.contains('/') || prefix.len() > 16 {
            return Err(KernelError::Invalid);
        }
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(KernelError::Exist);
        }
        let fs = self.fstypes.get(fstype).ok_or(KernelError::NoFilesys)?;
        let dev = self.devices.get(devname).ok();
        let ops = fs.mount(dev.as_ref(), exec)?;
        log::info!("mounted {} on /{} ({})", devname, prefix, fstype);
        self.mounts.push(MountPoint {
            prefix: prefix.to_string(),
            ops,
            dev_name: dev.is_some().then(|| devname.to_string()),
        });
        Ok(())
    }

    /// Resolve a path to (mount index, path within the mount).
    pub fn lookup(&self, path: &str) -> KernelResult<(usize, String)> {
        if path.len() > VFS_MAX_PATH_LEN {
            return Err(KernelError::NameTooLong);
        }
        let stripped = path.strip_prefix('/').ok_or(KernelError::Invalid)?;
        let (prefix, rest) = match stripped.find('/') {
            Some(at) => (&stripped[..at], &stripped[at..]),
            None => (stripped, "/"),
        };
        let idx = self
            .mounts
            .iter()
            .position(|m| m.prefix == prefix)
            .ok_or(KernelError::NotFound)?;
        Ok((idx, rest.to_string()))
    }

    pub fn mount_at(&self, idx: usize) -> &MountPoint {
        &self.mounts[idx]
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Open a file, running the ACL check against existing targets.
    pub fn open(
        &self,
        path: &str,
        mode: OpenMode,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<File> {
        if !mode.intersects(OpenMode::READ | OpenMode::WRITE) {
            return Err(KernelError::Invalid);
        }
        let (idx, rest) = self.lookup(path)?;
        let mp = &self.mounts[idx];
        match mp.ops.stat(&rest, exec) {
            Ok(stat) => check_acl(&stat, euid, mode)?,
            Err(KernelError::NotFound) if mode.contains(OpenMode::CREATE) => {}
            Err(KernelError::NotFound) => return Err(KernelError::NotFound),
            // consoles and friends have nothing to stat
            Err(KernelError::Unsupported) => {}
            Err(e) => return Err(e),
        }
        let mut file = mp.ops.open(&rest, mode, euid, exec)?;
        file.mount = Some(idx);
        Ok(file)
    }

    pub fn open_directory(&self, path: &str, exec: &mut Exec) -> KernelResult<File> {
        let (idx, rest) = self.lookup(path)?;
        let mut file = self.mounts[idx].ops.open_directory(&rest, exec)?;
        file.mount = Some(idx);
        Ok(file)
    }

    pub fn create_directory(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        let (idx, rest) = self.lookup(path)?;
        self.mounts[idx].ops.create_directory(&rest, euid, exec)
    }

    pub fn stat(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<FileStat> {
        let (idx, rest) = self.lookup(path)?;
        let stat = self.mounts[idx].ops.stat(&rest, exec)?;
        check_acl(&stat, euid, OpenMode::empty())?;
        Ok(stat)
    }

    /// Delete a file or empty directory; requires write permission.
    pub fn delete(&self, path: &str, euid: u32, exec: &mut Exec) -> KernelResult<()> {
        let (idx, rest) = self.lookup(path)?;
        let mp = &self.mounts[idx];
        let stat = mp.ops.stat(&rest, exec)?;
        check_acl(&stat, euid, OpenMode::WRITE)?;
        mp.ops.delete(&rest, exec)
    }

    pub fn set_acl(
        &self,
        path: &str,
        uid: u32,
        perms: u32,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let (idx, rest) = self.lookup(path)?;
        self.mounts[idx].ops.set_acl(&rest, uid, perms, euid, exec)
    }

    pub fn set_setuid(
        &self,
        path: &str,
        flag: bool,
        euid: u32,
        exec: &mut Exec,
    ) -> KernelResult<()> {
        let (idx, rest) = self.lookup(path)?;
        self.mounts[idx].ops.set_setuid(&rest, flag, euid, exec)
    }

    /// Sync every mounted filesystem.
    pub fn sync_all(&self, exec: &mut Exec) -> KernelResult<()> {
        for mp in &self.mounts {
            mp.ops.sync(exec)?;
        }
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_with(owner: AclEntry, extra: AclEntry) -> FileStat {
        let mut acls: [AclEntry; VFS_MAX_ACL_ENTRIES] = Default::default();
        acls[0] = owner;
        acls[1] = extra;
        FileStat {
            size: 0,
            is_directory: false,
            is_setuid: false,
            acls,
        }
    }

    #[test]
    fn test_acl_owner_subset_rule() {
        let stat = stat_with(
            AclEntry {
                uid: 7,
                permission: OpenMode::READ.bits(),
            },
            AclEntry::default(),
        );
        assert!(check_acl(&stat, 7, OpenMode::READ).is_ok());
        assert_eq!(
            check_acl(&stat, 7, OpenMode::READ | OpenMode::WRITE),
            Err(KernelError::Access)
        );
    }

    #[test]
    fn test_acl_non_owner_needs_matching_entry() {
        let stat = stat_with(
            AclEntry {
                uid: 7,
                permission: OpenMode::READ.bits() | OpenMode::WRITE.bits(),
            },
            AclEntry {
                uid: 9,
                permission: OpenMode::READ.bits(),
            },
        );
        assert!(check_acl(&stat, 9, OpenMode::READ).is_ok());
        assert_eq!(
            check_acl(&stat, 9, OpenMode::WRITE),
            Err(KernelError::Access)
        );
        assert_eq!(
            check_acl(&stat, 11, OpenMode::READ),
            Err(KernelError::Access)
        );
    }

    #[test]
    fn test_acl_root_bypasses() {
        let stat = stat_with(
            AclEntry {
                uid: 7,
                permission: 0,
            },
            AclEntry::default(),
        );
        assert!(check_acl(&stat, 0, OpenMode::READ | OpenMode::WRITE).is_ok());
    }

    #[test]
    fn test_lookup_prefix_split() {
        let vfs = Vfs::new();
        assert_eq!(vfs.lookup("no-slash").unwrap_err(), KernelError::Invalid);
        // nothing mounted yet
        assert_eq!(vfs.lookup("/c/a").unwrap_err(), KernelError::NotFound);
    }
}
