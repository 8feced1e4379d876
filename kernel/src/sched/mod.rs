//! Kernel threads and the scheduler
//!
//! Two runtime-selectable policies share four ready queues: round-robin
//! (all threads on level 0, highest priority first) and multi-level
//! feedback (level 0 is best; full-quantum burns demote, wake-ups after
//! blocking promote).

mod queue;
mod scheduler;
mod thread;

pub use queue::{RunQueues, MAX_QUEUE_LEVEL};
pub use scheduler::{SchedPolicy, Scheduler};
pub use thread::{Thread, ThreadTable};

use crate::error::KernelError;
use crate::sync::{IntState, WaitQueue};

/// Thread identifier.
pub type Pid = u32;

/// Numeric thread priority; larger is better.
pub type Priority = u32;

pub const PRIORITY_IDLE: Priority = 0;
pub const PRIORITY_USER: Priority = 1;
pub const PRIORITY_NORMAL: Priority = 5;
pub const PRIORITY_HIGH: Priority = 10;

/// Raw policy selectors, as passed to the scheduling-policy syscall.
pub const SCHEDULE_ROUNDROBIN: u32 = 0;
pub const SCHEDULE_MLF: u32 = 1;

/// The scheduling context threaded through every blocking operation:
/// the interrupt flag, the scheduler, the thread table, and the calling
/// thread. Parking and waking always go through here so the blocked
/// flag, the wait queue, and the ready queues stay consistent.
pub struct Exec<'a> {
    pub ints: &'a mut IntState,
    pub sched: &'a mut Scheduler,
    pub threads: &'a mut ThreadTable,
    pub current: Pid,
    /// Current timer tick, for timestamps and age stamps.
    pub now: u64,
}

impl Exec<'_> {
    pub fn current_thread(&mut self) -> &mut Thread {
        self.threads.thread_mut(self.current)
    }

    /// Park the calling thread on `queue` and return the error the
    /// operation propagates to the dispatcher:
    ///
    /// ```ignore
    /// return Err(exec.block_on(&mut pipe.rd_queue));
    /// ```
    pub fn block_on(&mut self, queue: &mut WaitQueue) -> KernelError {
        let iflag = self.ints.begin_atomic();
        queue.enqueue(self.current);
        self.current_thread().blocked = true;
        self.ints.end_atomic(iflag);
        KernelError::WouldBlock
    }

    /// Move the single highest-priority waiter to a ready queue.
    pub fn wake_one(&mut self, queue: &mut WaitQueue) -> Option<Pid> {
        let threads = &mut *self.threads;
        let pid = queue.pick_best(|p| threads.thread(p).priority)?;
        let iflag = self.ints.begin_atomic();
        self.sched.make_runnable(self.ints, threads.thread_mut(pid));
        self.ints.end_atomic(iflag);
        Some(pid)
    }

    /// Move every waiter to a ready queue, front to back.
    pub fn wake_all(&mut self, queue: &mut WaitQueue) {
        let iflag = self.ints.begin_atomic();
        for pid in queue.drain() {
            self.sched
                .make_runnable(self.ints, self.threads.thread_mut(pid));
        }
        self.ints.end_atomic(iflag);
    }
}
