//! Filesystem syscalls
//!
//! User pointers are never dereferenced: every path, buffer and
//! out-parameter moves through the bounded user-copy routines. Stat
//! records and directory entries cross the boundary in the fixed
//! little-endian layouts described below.

use alloc::borrow::ToOwned;

use super::{copy_out, current_ctx, user_bytes, user_string, with_fd, Syscall, SyscallFrame};
use crate::error::{KernelError, KernelResult};
use crate::fs::file::OpenMode;
use crate::fs::{FileStat, VfsDirEntry, VFS_MAX_ACL_ENTRIES, VFS_MAX_PATH_LEN};
use crate::kernel::Kernel;

/// Mount/format request block: devname[64] | prefix[64] | fstype[32],
/// each NUL-terminated.
const MOUNT_REQUEST_SIZE: usize = 64 + 64 + 32;

/// Stat record: size(8) | is_directory(4) | is_setuid(4) | acl[10] of
/// (uid:4, perm:4).
const STAT_RECORD_SIZE: usize = 16 + VFS_MAX_ACL_ENTRIES * 8;

/// Directory entry record: name[128] NUL-terminated | stat record.
const DIR_RECORD_SIZE: usize = 128 + STAT_RECORD_SIZE;

fn encode_stat(stat: &FileStat, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), STAT_RECORD_SIZE);
    buf[0..8].copy_from_slice(&stat.size.to_le_bytes());
    buf[8..12].copy_from_slice(&(stat.is_directory as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&(stat.is_setuid as u32).to_le_bytes());
    for (i, acl) in stat.acls.iter().enumerate() {
        let at = 16 + i * 8;
        buf[at..at + 4].copy_from_slice(&acl.uid.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&acl.permission.to_le_bytes());
    }
}

fn encode_dir_entry(entry: &VfsDirEntry, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), DIR_RECORD_SIZE);
    buf[..128].fill(0);
    let name = entry.name.as_bytes();
    let n = name.len().min(127);
    buf[..n].copy_from_slice(&name[..n]);
    encode_stat(&entry.stat, &mut buf[128..]);
}

/// Pull one NUL-terminated string out of a fixed request field.
fn field_str(field: &[u8]) -> KernelResult<&str> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(KernelError::NameTooLong)?;
    core::str::from_utf8(&field[..end]).map_err(|_| KernelError::Invalid)
}

fn install_fd(k: &mut Kernel, file: crate::fs::file::File) -> KernelResult<i32> {
    let ctx_id = current_ctx(k)?;
    let ctx = k.vm.contexts.ctx_mut(ctx_id);
    let fd = ctx.alloc_fd()?;
    ctx.files[fd] = Some(file);
    Ok(fd as i32)
}

pub(super) fn handle(k: &mut Kernel, call: Syscall, frame: &SyscallFrame) -> KernelResult<i32> {
    match call {
        Syscall::Mount => {
            let req = user_bytes(k, frame.arg1, MOUNT_REQUEST_SIZE)?;
            let devname = field_str(&req[0..64])?.to_owned();
            let prefix = field_str(&req[64..128])?.to_owned();
            let fstype = field_str(&req[128..160])?.to_owned();
            k.mount(&devname, &prefix, &fstype)?;
            Ok(0)
        }
        Syscall::Format => {
            let req = user_bytes(k, frame.arg1, MOUNT_REQUEST_SIZE)?;
            let devname = field_str(&req[0..64])?.to_owned();
            let fstype = field_str(&req[128..160])?.to_owned();
            k.format(&devname, &fstype)?;
            Ok(0)
        }
        Syscall::Open => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            let mode = OpenMode::from_bits(frame.arg3).ok_or(KernelError::Invalid)?;
            let file = k.open(&path, mode)?;
            install_fd(k, file)
        }
        Syscall::OpenDirectory => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            let dir = k.open_directory(&path)?;
            install_fd(k, dir)
        }
        Syscall::Close => {
            let ctx_id = current_ctx(k)?;
            let file = k
                .vm
                .contexts
                .ctx_mut(ctx_id)
                .files
                .get_mut(frame.arg1 as usize)
                .and_then(Option::take)
                .ok_or(KernelError::Invalid)?;
            k.file_close(file)?;
            Ok(0)
        }
        Syscall::Delete => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            k.delete(&path)?;
            Ok(0)
        }
        Syscall::Read => {
            let len = frame.arg3 as usize;
            let data = with_fd(k, frame.arg1 as usize, |k, file| {
                let mut buf = alloc::vec![0u8; len.min(super::MAX_TRANSFER)];
                let n = k.file_read(file, &mut buf)?;
                buf.truncate(n);
                Ok(buf)
            })?;
            copy_out(k, frame.arg2, &data)?;
            Ok(data.len() as i32)
        }
        Syscall::ReadEntry => {
            let entry = with_fd(k, frame.arg1 as usize, |k, file| k.read_entry(file))?;
            match entry {
                Some(entry) => {
                    let mut record = [0u8; DIR_RECORD_SIZE];
                    encode_dir_entry(&entry, &mut record);
                    copy_out(k, frame.arg2, &record)?;
                    Ok(0)
                }
                // end of the directory snapshot
                None => Ok(1),
            }
        }
        Syscall::Write => {
            let data = user_bytes(k, frame.arg2, frame.arg3 as usize)?;
            let n = with_fd(k, frame.arg1 as usize, |k, file| k.file_write(file, &data))?;
            Ok(n as i32)
        }
        Syscall::Stat => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            let stat = k.stat(&path)?;
            let mut record = [0u8; STAT_RECORD_SIZE];
            encode_stat(&stat, &mut record);
            copy_out(k, frame.arg3, &record)?;
            Ok(0)
        }
        Syscall::Fstat => {
            let stat = with_fd(k, frame.arg1 as usize, |k, file| k.file_stat(file))?;
            let mut record = [0u8; STAT_RECORD_SIZE];
            encode_stat(&stat, &mut record);
            copy_out(k, frame.arg2, &record)?;
            Ok(0)
        }
        Syscall::Seek => {
            with_fd(k, frame.arg1 as usize, |k, file| {
                k.file_seek(file, frame.arg2 as u64)
            })?;
            Ok(0)
        }
        Syscall::CreateDir => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            k.create_directory(&path)?;
            Ok(0)
        }
        Syscall::Sync => {
            k.sync()?;
            Ok(0)
        }
        Syscall::CreatePipe => {
            let (read, write) = k.create_pipe();
            let rd_fd = install_fd(k, read)?;
            let wr_fd = match install_fd(k, write) {
                Ok(fd) => fd,
                Err(e) => {
                    // roll the read end back out of the table
                    let ctx_id = current_ctx(k)?;
                    if let Some(file) =
                        k.vm.contexts.ctx_mut(ctx_id).files[rd_fd as usize].take()
                    {
                        let _ = k.file_close(file);
                    }
                    return Err(e);
                }
            };
            copy_out(k, frame.arg1, &(rd_fd as u32).to_le_bytes())?;
            copy_out(k, frame.arg2, &(wr_fd as u32).to_le_bytes())?;
            Ok(0)
        }
        Syscall::SetAcl => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            k.set_acl(&path, frame.arg3, frame.arg4)?;
            Ok(0)
        }
        Syscall::SetSetuid => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            k.set_setuid(&path, frame.arg3 != 0)?;
            Ok(0)
        }
        _ => Err(KernelError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::AclEntry;

    #[test]
    fn test_stat_record_layout() {
        let mut acls: [AclEntry; VFS_MAX_ACL_ENTRIES] = Default::default();
        acls[0] = AclEntry {
            uid: 3,
            permission: 3,
        };
        let stat = FileStat {
            size: 0x0102_0304,
            is_directory: true,
            is_setuid: false,
            acls,
        };
        let mut record = [0u8; STAT_RECORD_SIZE];
        encode_stat(&stat, &mut record);
        assert_eq!(u64::from_le_bytes(record[0..8].try_into().unwrap()), 0x0102_0304);
        assert_eq!(record[8], 1);
        assert_eq!(record[12], 0);
        assert_eq!(record[16], 3); // owner uid
        assert_eq!(record[20], 3); // owner perms
    }

    #[test]
    fn test_dir_record_carries_name() {
        let entry = VfsDirEntry {
            name: alloc::string::String::from("file.txt"),
            stat: FileStat::default(),
        };
        let mut record = [0u8; DIR_RECORD_SIZE];
        encode_dir_entry(&entry, &mut record);
        assert_eq!(&record[..8], b"file.txt");
        assert_eq!(record[8], 0);
    }

    #[test]
    fn test_field_str_requires_nul() {
        assert_eq!(field_str(b"disk0\0junk").unwrap(), "disk0");
        assert_eq!(
            field_str(b"no-terminator").unwrap_err(),
            KernelError::NameTooLong
        );
    }
}
