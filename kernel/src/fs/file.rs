//! Open files
//!
//! An open file is a position, an end position, mode bits, and a tagged
//! body naming what it actually is: a console endpoint, a GOSFS file, a
//! directory snapshot, or one end of a pipe. Operations a body does not
//! support fail with `UNSUPPORTED`. Files are duplicated with `clone`
//! and reference-counted down in `close`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::console::Console;
use super::gosfs::Gosfs;
use super::pipe::{Pipe, PipeEnd};
use super::{FileStat, VfsDirEntry};
use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;

bitflags! {
    /// Open-mode bits, shared with the ACL permission encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenMode: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const CREATE = 1 << 2;
    }
}

/// Which console endpoint a console file talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKind {
    Input,
    Output,
}

/// Shared per-open-file state of a GOSFS file; clones share it through
/// the `Arc`, whose strong count is the entry's reference count.
#[derive(Debug)]
pub struct GosFileEntry {
    pub instance: Arc<Gosfs>,
    pub inode: u32,
}

/// The in-memory listing a directory open captured; `read_entry`
/// streams it in a single shot.
#[derive(Debug)]
pub struct DirSnapshot {
    pub entries: Vec<VfsDirEntry>,
}

/// What an open file actually refers to.
pub enum FileBody {
    Console(ConsoleKind),
    Gos(Arc<GosFileEntry>),
    Dir(DirSnapshot),
    Pipe { pipe: Arc<Pipe>, end: PipeEnd },
}

/// Ambient state file operations may need: the scheduling context for
/// blocking bodies and the console for console bodies.
pub struct FileCx<'a, 'e> {
    pub exec: &'a mut Exec<'e>,
    pub console: &'a mut Console,
}

pub struct File {
    pub body: FileBody,
    pub pos: u64,
    pub end_pos: u64,
    pub mode: OpenMode,
    /// Index into the mount table of the mount this file came from.
    pub mount: Option<usize>,
}

impl File {
    pub fn new(body: FileBody, end_pos: u64, mode: OpenMode, mount: Option<usize>) -> Self {
        Self {
            body,
            pos: 0,
            end_pos,
            mode,
            mount,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.body, FileBody::Dir(_))
    }

    /// Read from the current position. Pipes and console input block
    /// when empty; a GOSFS read advances the position by the number of
    /// bytes requested.
    pub fn read(&mut self, buf: &mut [u8], cx: &mut FileCx) -> KernelResult<usize> {
        match &self.body {
            FileBody::Console(ConsoleKind::Input) => cx.console.read(buf, cx.exec),
            FileBody::Console(ConsoleKind::Output) => Err(KernelError::Unsupported),
            FileBody::Gos(entry) => {
                let entry = entry.clone();
                let n = entry
                    .instance
                    .file_read(entry.inode, self.pos, self.end_pos, self.mode, buf, cx.exec)?;
                if n > 0 {
                    self.pos += buf.len() as u64;
                }
                Ok(n)
            }
            FileBody::Dir(_) => Err(KernelError::Unsupported),
            FileBody::Pipe {
                pipe,
                end: PipeEnd::Read,
            } => pipe.clone().read(buf, cx.exec),
            FileBody::Pipe { .. } => Err(KernelError::Unsupported),
        }
    }

    /// Write at the current position, extending GOSFS files as needed.
    pub fn write(&mut self, buf: &[u8], cx: &mut FileCx) -> KernelResult<usize> {
        match &self.body {
            FileBody::Console(ConsoleKind::Output) => {
                cx.console.put_bytes(buf);
                Ok(buf.len())
            }
            FileBody::Console(ConsoleKind::Input) => Err(KernelError::Unsupported),
            FileBody::Gos(entry) => {
                let entry = entry.clone();
                let (n, size) =
                    entry
                        .instance
                        .file_write(entry.inode, self.pos, self.mode, buf, cx.exec)?;
                self.pos += n as u64;
                if size > self.end_pos {
                    self.end_pos = size;
                }
                Ok(n)
            }
            FileBody::Dir(_) => Err(KernelError::Unsupported),
            FileBody::Pipe {
                pipe,
                end: PipeEnd::Write,
            } => pipe.clone().write(buf, cx.exec),
            FileBody::Pipe { .. } => Err(KernelError::Unsupported),
        }
    }

    /// Reposition. Only GOSFS files and directory snapshots seek.
    pub fn seek(&mut self, pos: u64) -> KernelResult<()> {
        match &self.body {
            FileBody::Gos(_) | FileBody::Dir(_) => {
                self.pos = pos;
                Ok(())
            }
            _ => Err(KernelError::Unsupported),
        }
    }

    /// Metadata for this open file.
    pub fn fstat(&self, exec: &mut Exec) -> KernelResult<FileStat> {
        match &self.body {
            FileBody::Gos(entry) => entry.instance.stat_inode(entry.inode, exec),
            FileBody::Dir(_) => Ok(FileStat {
                size: self.end_pos,
                is_directory: true,
                is_setuid: false,
                acls: Default::default(),
            }),
            _ => Err(KernelError::Unsupported),
        }
    }

    /// Stream the next entry of a directory snapshot; `None` at the
    /// end.
    pub fn read_entry(&mut self) -> KernelResult<Option<VfsDirEntry>> {
        match &self.body {
            FileBody::Dir(snapshot) => {
                let at = self.pos as usize;
                if at >= snapshot.entries.len() {
                    return Ok(None);
                }
                let entry = snapshot.entries[at].clone();
                self.pos += 1;
                Ok(Some(entry))
            }
            _ => Err(KernelError::Unsupported),
        }
    }

    /// Duplicate this open file. The clone shares the underlying
    /// object but reads and seeks independently.
    pub fn clone_file(&self, exec: &mut Exec) -> KernelResult<File> {
        let body = match &self.body {
            FileBody::Console(kind) => FileBody::Console(*kind),
            FileBody::Gos(entry) => FileBody::Gos(entry.clone()),
            FileBody::Dir(_) => return Err(KernelError::Unsupported),
            FileBody::Pipe { pipe, end } => {
                pipe.add_ref(*end, exec.ints);
                FileBody::Pipe {
                    pipe: pipe.clone(),
                    end: *end,
                }
            }
        };
        Ok(File {
            body,
            pos: self.pos,
            end_pos: self.end_pos,
            mode: self.mode,
            mount: self.mount,
        })
    }

    /// Drop this reference. The last close of a pipe end wakes the
    /// peers so they observe EOF; the last close of a GOSFS entry
    /// releases it.
    pub fn close(self, exec: &mut Exec) -> KernelResult<()> {
        match self.body {
            FileBody::Pipe { pipe, end } => {
                pipe.close(end, exec);
                Ok(())
            }
            // console files are stateless; GOSFS entries and directory
            // snapshots are released by drop
            _ => Ok(()),
        }
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let body = match &self.body {
            FileBody::Console(ConsoleKind::Input) => "console-in",
            FileBody::Console(ConsoleKind::Output) => "console-out",
            FileBody::Gos(_) => "gosfs",
            FileBody::Dir(_) => "directory",
            FileBody::Pipe {
                end: PipeEnd::Read, ..
            } => "pipe-read",
            FileBody::Pipe {
                end: PipeEnd::Write,
                ..
            } => "pipe-write",
        };
        f.debug_struct("File")
            .field("body", &body)
            .field("pos", &self.pos)
            .field("end_pos", &self.end_pos)
            .field("mode", &self.mode)
            .finish()
    }
}
