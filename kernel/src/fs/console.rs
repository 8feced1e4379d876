//! Console pseudo-filesystem
//!
//! The console is a keyboard byte queue plus a screen byte sink with a
//! cursor and attribute. "consfs" exposes the two endpoints as files
//! (`input`, `output`); everything directory-shaped is unsupported,
//! which exercises the VFS null-dispatch contract.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use super::blockdev::SharedDisk;
use super::file::{ConsoleKind, File, FileBody, OpenMode};
use super::{FileStat, FilesystemOps, MountPointOps};
use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;
use crate::sync::WaitQueue;

/// Modeled screen geometry.
pub const NUM_ROWS: u32 = 25;
pub const NUM_COLS: u32 = 80;

#[derive(Debug, Default)]
pub struct Console {
    input: VecDeque<u8>,
    output: Vec<u8>,
    pub key_wait: WaitQueue,
    cursor: (u32, u32),
    attr: u8,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed keystrokes, waking one blocked reader.
    pub fn push_keys(&mut self, keys: &[u8], exec: &mut Exec) {
        self.input.extend(keys.iter().copied());
        exec.wake_one(&mut self.key_wait);
    }

    /// Take one key, blocking while the queue is empty.
    pub fn get_key(&mut self, exec: &mut Exec) -> KernelResult<u8> {
        match self.input.pop_front() {
            Some(key) => Ok(key),
            None => Err(exec.block_on(&mut self.key_wait)),
        }
    }

    /// Read up to `buf.len()` queued keys; blocks only when none are
    /// available at all.
    pub fn read(&mut self, buf: &mut [u8], exec: &mut Exec) -> KernelResult<usize> {
        if self.input.is_empty() {
            return Err(exec.block_on(&mut self.key_wait));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop_front() {
                Some(key) => {
                    buf[n] = key;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Everything written so far, draining the sink.
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.output)
    }

    pub fn set_cursor(&mut self, row: u32, col: u32) -> KernelResult<()> {
        if row >= NUM_ROWS || col >= NUM_COLS {
            return Err(KernelError::Invalid);
        }
        self.cursor = (row, col);
        Ok(())
    }

    pub fn cursor(&self) -> (u32, u32) {
        self.cursor
    }

    pub fn set_attr(&mut self, attr: u8) {
        self.attr = attr;
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }
}

/// The console filesystem type and its (stateless) mount point.
pub struct ConsFs;

impl FilesystemOps for ConsFs {
    fn format(&self, _dev: Option<&SharedDisk>, _exec: &mut Exec) -> KernelResult<()> {
        Err(KernelError::Unsupported)
    }

    fn mount(
        &self,
        _dev: Option<&SharedDisk>,
        _exec: &mut Exec,
    ) -> KernelResult<Box<dyn MountPointOps>> {
        Ok(Box::new(ConsFsMount))
    }
}

struct ConsFsMount;

impl MountPointOps for ConsFsMount {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        _euid: u32,
        _exec: &mut Exec,
    ) -> KernelResult<File> {
        match path {
            "/input" if mode.contains(OpenMode::READ) => Ok(File::new(
                FileBody::Console(ConsoleKind::Input),
                0,
                OpenMode::READ,
                None,
            )),
            "/output" if mode.contains(OpenMode::WRITE) => Ok(File::new(
                FileBody::Console(ConsoleKind::Output),
                0,
                OpenMode::WRITE,
                None,
            )),
            "/input" | "/output" => Err(KernelError::Access),
            _ => Err(KernelError::NotFound),
        }
    }

    fn create_directory(&self, _path: &str, _euid: u32, _exec: &mut Exec) -> KernelResult<()> {
        Err(KernelError::Unsupported)
    }

    fn open_directory(&self, _path: &str, _exec: &mut Exec) -> KernelResult<File> {
        Err(KernelError::Unsupported)
    }

    fn stat(&self, path: &str, _exec: &mut Exec) -> KernelResult<FileStat> {
        match path {
            "/input" | "/output" => Ok(FileStat {
                size: 0,
                is_directory: false,
                is_setuid: false,
                acls: Default::default(),
            }),
            _ => Err(KernelError::NotFound),
        }
    }

    fn sync(&self, _exec: &mut Exec) -> KernelResult<()> {
        Ok(())
    }

    fn delete(&self, _path: &str, _exec: &mut Exec) -> KernelResult<()> {
        Err(KernelError::Unsupported)
    }

    fn name(&self) -> String {
        String::from("consfs")
    }
}
