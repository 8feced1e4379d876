//! Thread control blocks and the thread table

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{Pid, Priority};
use crate::mm::CtxId;
use crate::sync::WaitQueue;
use crate::syscall::PendingSyscall;

/// A kernel thread.
///
/// Threads survive in the table after death until a joiner reaps them,
/// so `wait` can still collect the exit code.
#[derive(Debug)]
pub struct Thread {
    pub pid: Pid,
    pub priority: Priority,
    /// Ready-queue level this thread enqueues to (0 = best).
    pub current_level: usize,
    /// Set while parked on a wait queue; cleared by `make_runnable`.
    pub blocked: bool,
    pub alive: bool,
    pub exit_code: i32,
    /// User context handle; `None` for pure kernel threads.
    pub context: Option<CtxId>,
    /// Semaphores this thread is registered for. One entry per
    /// create, so double-create needs double-destroy.
    pub semaphores: Vec<u32>,
    /// Threads waiting in `wait` for this one to exit.
    pub join_queue: WaitQueue,
    /// Ticks consumed of the current quantum.
    pub quantum_used: u32,
    /// Syscall to re-issue when this thread is dispatched again.
    pub pending: Option<PendingSyscall>,
    /// Set when a V hands this thread a semaphore it already
    /// decremented for; the retried P completes without touching the
    /// count again.
    pub sem_granted: bool,
}

impl Thread {
    fn new(pid: Pid, priority: Priority) -> Self {
        Self {
            pid,
            priority,
            current_level: 0,
            blocked: false,
            alive: true,
            exit_code: 0,
            context: None,
            semaphores: Vec::new(),
            join_queue: WaitQueue::new(),
            quantum_used: 0,
            pending: None,
            sem_granted: false,
        }
    }

    /// Consume a pending semaphore grant.
    pub fn take_grant(&mut self) -> bool {
        core::mem::take(&mut self.sem_granted)
    }
}

/// All threads, live and dead-but-unreaped, keyed by pid.
#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: BTreeMap<Pid, Thread>,
    next_pid: Pid,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            next_pid: 1,
        }
    }

    pub fn create(&mut self, priority: Priority) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.threads.insert(pid, Thread::new(pid, priority));
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Thread> {
        self.threads.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Thread> {
        self.threads.get_mut(&pid)
    }

    /// Panicking accessor for threads that must exist.
    pub fn thread(&self, pid: Pid) -> &Thread {
        self.threads.get(&pid).expect("no such thread")
    }

    /// Panicking mutable accessor for threads that must exist.
    pub fn thread_mut(&mut self, pid: Pid) -> &mut Thread {
        self.threads.get_mut(&pid).expect("no such thread")
    }

    /// Reap a thread, removing its TCB.
    pub fn remove(&mut self, pid: Pid) -> Option<Thread> {
        self.threads.remove(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.threads.values_mut()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
