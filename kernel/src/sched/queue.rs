//! Ready queue management for the scheduler

use alloc::collections::VecDeque;

use super::{Pid, Priority};

/// Number of ready-queue levels. Level 0 is the highest priority.
pub const MAX_QUEUE_LEVEL: usize = 4;

/// The per-level FIFO ready queues.
#[derive(Debug, Default)]
pub struct RunQueues {
    levels: [VecDeque<Pid>; MAX_QUEUE_LEVEL],
}

impl RunQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, level: usize, pid: Pid) {
        debug_assert!(level < MAX_QUEUE_LEVEL);
        debug_assert!(!self.contains(pid));
        self.levels[level].push_back(pid);
    }

    /// Unlink a thread from whatever level it sits on. Returns the
    /// level it was found at.
    pub fn remove(&mut self, pid: Pid) -> Option<usize> {
        for (level, queue) in self.levels.iter_mut().enumerate() {
            if let Some(at) = queue.iter().position(|&p| p == pid) {
                queue.remove(at);
                return Some(level);
            }
        }
        None
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.levels.iter().any(|q| q.contains(&pid))
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn total_len(&self) -> usize {
        self.levels.iter().map(|q| q.len()).sum()
    }

    /// MLF selection: head of the first non-empty queue, scanning from
    /// level 0 upward.
    pub fn pop_mlf(&mut self) -> Option<Pid> {
        self.levels.iter_mut().find_map(|q| q.pop_front())
    }

    /// RR selection: the highest-priority thread on level 0, FIFO among
    /// equals. Levels 1..3 are deliberately not consulted.
    pub fn pop_rr(&mut self, prio_of: impl Fn(Pid) -> Priority) -> Option<Pid> {
        let queue = &mut self.levels[0];
        let mut best: Option<(usize, Priority)> = None;
        for (at, &pid) in queue.iter().enumerate() {
            let prio = prio_of(pid);
            match best {
                Some((_, bp)) if prio <= bp => {}
                _ => best = Some((at, prio)),
            }
        }
        let (at, _) = best?;
        queue.remove(at)
    }

    /// Drain every level into `level`, preserving level-then-FIFO order.
    pub fn collapse_into(&mut self, level: usize) {
        let mut moved: VecDeque<Pid> = VecDeque::new();
        for queue in self.levels.iter_mut() {
            moved.append(queue);
        }
        self.levels[level] = moved;
    }

    /// Move one specific thread to `level`, keeping FIFO order there.
    pub fn move_to(&mut self, pid: Pid, level: usize) {
        if self.remove(pid).is_some() {
            self.levels[level].push_back(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mlf_scans_from_level_zero() {
        let mut q = RunQueues::new();
        q.enqueue(2, 20);
        q.enqueue(0, 10);
        q.enqueue(1, 15);
        assert_eq!(q.pop_mlf(), Some(10));
        assert_eq!(q.pop_mlf(), Some(15));
        assert_eq!(q.pop_mlf(), Some(20));
        assert_eq!(q.pop_mlf(), None);
    }

    #[test]
    fn test_rr_ignores_lower_levels() {
        let mut q = RunQueues::new();
        q.enqueue(1, 10);
        assert_eq!(q.pop_rr(|_| 5), None);
        q.enqueue(0, 11);
        assert_eq!(q.pop_rr(|_| 5), Some(11));
    }

    #[test]
    fn test_rr_picks_highest_priority_fifo_ties() {
        let mut q = RunQueues::new();
        q.enqueue(0, 1);
        q.enqueue(0, 2);
        q.enqueue(0, 3);
        let prio = |pid: Pid| if pid == 2 { 9 } else { 5 };
        assert_eq!(q.pop_rr(prio), Some(2));
        assert_eq!(q.pop_rr(prio), Some(1));
        assert_eq!(q.pop_rr(prio), Some(3));
    }

    #[test]
    fn test_collapse_preserves_order() {
        let mut q = RunQueues::new();
        q.enqueue(0, 1);
        q.enqueue(1, 2);
        q.enqueue(3, 3);
        q.collapse_into(0);
        assert_eq!(q.level_len(0), 3);
        assert_eq!(q.pop_mlf(), Some(1));
        assert_eq!(q.pop_mlf(), Some(2));
        assert_eq!(q.pop_mlf(), Some(3));
    }
}
