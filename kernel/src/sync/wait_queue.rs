//! Thread wait queues
//!
//! A wait queue is an ordered list of blocked threads. Wake-one hands
//! the single highest-priority waiter back to the scheduler (FIFO among
//! equal priorities); wake-all drains the queue. Thread termination
//! unlinks the dead thread from whatever queue it is parked on.

use alloc::collections::VecDeque;

use crate::sched::{Pid, Priority};

#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Pid>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Park a thread at the back of the queue.
    pub fn enqueue(&mut self, pid: Pid) {
        debug_assert!(!self.waiters.contains(&pid));
        self.waiters.push_back(pid);
    }

    /// Unlink a thread (termination, or a policy-driven move).
    /// Returns whether it was queued here.
    pub fn remove(&mut self, pid: Pid) -> bool {
        if let Some(at) = self.waiters.iter().position(|&w| w == pid) {
            self.waiters.remove(at);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.waiters.contains(&pid)
    }

    /// Remove and return the highest-priority waiter; queue order breaks
    /// ties. `prio_of` resolves a waiter's current priority.
    pub fn pick_best(&mut self, prio_of: impl Fn(Pid) -> Priority) -> Option<Pid> {
        let mut best: Option<(usize, Priority)> = None;
        for (at, &pid) in self.waiters.iter().enumerate() {
            let prio = prio_of(pid);
            match best {
                Some((_, bp)) if prio <= bp => {}
                _ => best = Some((at, prio)),
            }
        }
        let (at, _) = best?;
        self.waiters.remove(at)
    }

    /// Drain every waiter, front to back.
    pub fn drain(&mut self) -> VecDeque<Pid> {
        core::mem::take(&mut self.waiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_among_equals() {
        let mut q = WaitQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.pick_best(|_| 1), Some(1));
        assert_eq!(q.pick_best(|_| 1), Some(2));
        assert_eq!(q.pick_best(|_| 1), Some(3));
        assert_eq!(q.pick_best(|_| 1), None);
    }

    #[test]
    fn test_highest_priority_wins() {
        let mut q = WaitQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        // pid 2 has the highest priority
        let prio = |pid: Pid| if pid == 2 { 10 } else { 1 };
        assert_eq!(q.pick_best(prio), Some(2));
        assert_eq!(q.pick_best(prio), Some(1));
    }

    #[test]
    fn test_remove_unlinks() {
        let mut q = WaitQueue::new();
        q.enqueue(7);
        q.enqueue(8);
        assert!(q.remove(7));
        assert!(!q.remove(7));
        assert_eq!(q.len(), 1);
        assert!(q.contains(8));
    }
}
