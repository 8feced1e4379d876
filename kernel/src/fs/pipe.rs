//! Pipes
//!
//! A fixed-capacity circular byte buffer with one read end and one
//! write end (each cloneable). The read and write indices advance
//! modulo the capacity; one slot is always kept free so that
//! `rd == wr` means empty and never full. Readers block while the pipe
//! is empty and writers remain; writers block while it is full and
//! readers remain. All bookkeeping happens inside an atomic-interrupts
//! section.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::file::{File, FileBody, OpenMode};
use crate::error::KernelResult;
use crate::sched::Exec;
use crate::sync::{IntState, WaitQueue};

/// The amount of storage allocated for a pipe.
pub const PIPE_BUF_SIZE: usize = 4096;

/// Which end of the pipe a file object holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

#[derive(Debug)]
struct PipeInner {
    data: Vec<u8>,
    rd: usize,
    wr: usize,
    readers: u32,
    writers: u32,
    rd_queue: WaitQueue,
    wr_queue: WaitQueue,
    /// Lifetime totals, kept for the conservation check in tests.
    bytes_read: u64,
    bytes_written: u64,
}

impl PipeInner {
    fn available(&self) -> usize {
        (self.wr + self.data.len() - self.rd) % self.data.len()
    }

    fn free_space(&self) -> usize {
        // one slot stays unused to tell full from empty
        self.data.len() - 1 - self.available()
    }
}

/// The shared state behind both ends of a pipe.
pub struct Pipe {
    inner: Mutex<PipeInner>,
}

impl Pipe {
    /// Create a pipe and its two file endpoints `(read, write)`.
    pub fn create() -> (File, File) {
        let pipe = Arc::new(Pipe {
            inner: Mutex::new(PipeInner {
                data: vec![0u8; PIPE_BUF_SIZE],
                rd: 0,
                wr: 0,
                readers: 1,
                writers: 1,
                rd_queue: WaitQueue::new(),
                wr_queue: WaitQueue::new(),
                bytes_read: 0,
                bytes_written: 0,
            }),
        });
        let read = File::new(
            FileBody::Pipe {
                pipe: pipe.clone(),
                end: PipeEnd::Read,
            },
            0,
            OpenMode::READ,
            None,
        );
        let write = File::new(
            FileBody::Pipe {
                pipe,
                end: PipeEnd::Write,
            },
            0,
            OpenMode::WRITE,
            None,
        );
        (read, write)
    }

    /// File objects referencing this pipe, both ends combined.
    pub fn references(&self) -> u32 {
        let inner = self.inner.lock();
        inner.readers + inner.writers
    }

    /// Register a clone of one end.
    pub fn add_ref(&self, end: PipeEnd, ints: &mut IntState) {
        let iflag = ints.begin_atomic();
        let mut inner = self.inner.lock();
        match end {
            PipeEnd::Read => inner.readers += 1,
            PipeEnd::Write => inner.writers += 1,
        }
        ints.end_atomic(iflag);
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Blocks while the pipe is empty and writers remain; returns 0
    /// (end of file) once the pipe is empty and the last writer is
    /// gone.
    pub fn read(self: Arc<Self>, buf: &mut [u8], exec: &mut Exec) -> KernelResult<usize> {
        let iflag = exec.ints.begin_atomic();
        let mut inner = self.inner.lock();

        let avail = inner.available();
        if avail == 0 {
            if inner.writers == 0 {
                exec.ints.end_atomic(iflag);
                return Ok(0);
            }
            log::debug!("pipe read: pid {} waits, rd={} wr={}", exec.current, inner.rd, inner.wr);
            exec.wake_one(&mut inner.wr_queue);
            let err = exec.block_on(&mut inner.rd_queue);
            drop(inner);
            exec.ints.end_atomic(iflag);
            return Err(err);
        }

        let n = core::cmp::min(buf.len(), avail);
        let cap = inner.data.len();
        let rd = inner.rd;
        if rd + n > cap {
            let first = cap - rd;
            buf[..first].copy_from_slice(&inner.data[rd..]);
            buf[first..n].copy_from_slice(&inner.data[..n - first]);
        } else {
            buf[..n].copy_from_slice(&inner.data[rd..rd + n]);
        }
        inner.rd = (rd + n) % cap;
        inner.bytes_read += n as u64;

        exec.wake_one(&mut inner.wr_queue);
        drop(inner);
        exec.ints.end_atomic(iflag);
        Ok(n)
    }

    /// Write up to `buf.len()` bytes.
    ///
    /// Returns 0 when no readers remain; blocks while the pipe is
    /// full.
    pub fn write(self: Arc<Self>, buf: &[u8], exec: &mut Exec) -> KernelResult<usize> {
        let iflag = exec.ints.begin_atomic();
        let mut inner = self.inner.lock();

        if inner.readers == 0 {
            exec.ints.end_atomic(iflag);
            return Ok(0);
        }

        let free = inner.free_space();
        if free == 0 {
            log::debug!("pipe write: pid {} waits, rd={} wr={}", exec.current, inner.rd, inner.wr);
            exec.wake_one(&mut inner.rd_queue);
            let err = exec.block_on(&mut inner.wr_queue);
            drop(inner);
            exec.ints.end_atomic(iflag);
            return Err(err);
        }

        let n = core::cmp::min(buf.len(), free);
        let cap = inner.data.len();
        let wr = inner.wr;
        if wr + n > cap {
            let first = cap - wr;
            inner.data[wr..].copy_from_slice(&buf[..first]);
            inner.data[..n - first].copy_from_slice(&buf[first..n]);
        } else {
            inner.data[wr..wr + n].copy_from_slice(&buf[..n]);
        }
        inner.wr = (wr + n) % cap;
        inner.bytes_written += n as u64;

        exec.wake_one(&mut inner.rd_queue);
        drop(inner);
        exec.ints.end_atomic(iflag);
        Ok(n)
    }

    /// Drop one reference to `end`. Both wait queues are woken so
    /// pending partners observe the new end state; the buffer itself
    /// dies with the last `Arc`.
    pub fn close(self: Arc<Self>, end: PipeEnd, exec: &mut Exec) {
        let iflag = exec.ints.begin_atomic();
        let mut inner = self.inner.lock();
        match end {
            PipeEnd::Read => {
                assert!(inner.readers > 0);
                inner.readers -= 1;
            }
            PipeEnd::Write => {
                assert!(inner.writers > 0);
                inner.writers -= 1;
            }
        }
        log::debug!(
            "pipe close: pid {} readers={} writers={}",
            exec.current,
            inner.readers,
            inner.writers
        );
        exec.wake_all(&mut inner.rd_queue);
        exec.wake_all(&mut inner.wr_queue);
        drop(inner);
        exec.ints.end_atomic(iflag);
    }

    /// Lifetime byte totals `(written, read)`.
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.bytes_written, inner.bytes_read)
    }
}

impl core::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pipe")
            .field("available", &inner.available())
            .field("readers", &inner.readers)
            .field("writers", &inner.writers)
            .finish()
    }
}
