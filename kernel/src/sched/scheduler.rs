//! Scheduling policies and dispatch
//!
//! Round-robin keeps every thread on level 0 and always picks the
//! highest-priority runnable one. Multi-level feedback uses all four
//! queues: new threads start at level 0, a thread that burns its whole
//! quantum is demoted one level on requeue, a thread that comes back
//! from a wait queue is promoted one level, and the idle thread lives
//! at level 3.

use alloc::format;
use alloc::string::String;

use super::{Pid, RunQueues, Thread, ThreadTable, MAX_QUEUE_LEVEL, PRIORITY_IDLE};
use crate::error::{KernelError, KernelResult};
use crate::sync::IntState;

/// Selectable scheduling policy. The raw values are the syscall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    RoundRobin = 0,
    Mlf = 1,
}

impl SchedPolicy {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::RoundRobin),
            1 => Some(Self::Mlf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "RR",
            Self::Mlf => "MLF",
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    policy: SchedPolicy,
    quantum: u32,
    queues: RunQueues,
    /// Context switches since boot.
    pub context_switches: u64,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy, quantum: u32) -> Self {
        assert!(quantum > 0);
        Self {
            policy,
            quantum,
            queues: RunQueues::new(),
            context_switches: 0,
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn runnable_count(&self) -> usize {
        self.queues.total_len()
    }

    pub fn is_runnable(&self, pid: Pid) -> bool {
        self.queues.contains(pid)
    }

    /// Add a thread to the ready queue of its current level so it may
    /// be scheduled. Must be called with interrupts disabled.
    ///
    /// Under MLF a thread that was blocked is promoted one level before
    /// enqueueing; the blocked flag is cleared either way.
    pub fn make_runnable(&mut self, ints: &IntState, thread: &mut Thread) {
        assert!(!ints.enabled(), "make_runnable requires interrupts disabled");

        if self.policy == SchedPolicy::Mlf && thread.blocked && thread.current_level > 0 {
            thread.current_level -= 1;
            log::debug!(
                "thread {} promoted to ready queue {} after blocking",
                thread.pid,
                thread.current_level
            );
        }
        thread.blocked = false;
        self.queues.enqueue(thread.current_level, thread.pid);
    }

    /// Atomic wrapper around [`make_runnable`](Self::make_runnable) for
    /// callers running with interrupts enabled.
    pub fn make_runnable_atomic(&mut self, ints: &mut IntState, thread: &mut Thread) {
        let iflag = ints.begin_atomic();
        self.make_runnable(ints, thread);
        ints.end_atomic(iflag);
    }

    /// Apply the end-of-quantum feedback rule before a requeue: under
    /// MLF the thread drops one level, never below the last queue.
    pub fn demote_for_full_quantum(&mut self, thread: &mut Thread) {
        if self.policy == SchedPolicy::Mlf && thread.current_level < MAX_QUEUE_LEVEL - 1 {
            thread.current_level += 1;
            log::debug!(
                "thread {} moved to ready queue {}",
                thread.pid,
                thread.current_level
            );
        }
    }

    /// Remove and return the next thread to run. The idle thread
    /// guarantees a choice exists; an empty pick is a kernel bug.
    pub fn get_next_runnable(&mut self, threads: &ThreadTable) -> Pid {
        let best = match self.policy {
            SchedPolicy::Mlf => self.queues.pop_mlf(),
            // RR looks at level 0 only; the policy switch collapsed all
            // threads there. A thread made runnable on a lower level
            // while RR is active stays invisible until the next policy
            // switch renormalizes levels.
            SchedPolicy::RoundRobin => self.queues.pop_rr(|pid| threads.thread(pid).priority),
        };
        let pid = match best {
            Some(pid) => pid,
            None => panic!("no runnable thread"),
        };
        self.context_switches += 1;
        pid
    }

    /// Unlink a thread from the ready queues (termination path).
    pub fn unlink(&mut self, pid: Pid) {
        self.queues.remove(pid);
    }

    /// Switch policy and quantum atomically.
    ///
    /// Switching to RR collapses every thread to level 0; switching to
    /// MLF parks the idle thread on the last level. A non-positive
    /// quantum is invalid, an unknown policy unsupported.
    pub fn switch_policy(
        &mut self,
        ints: &mut IntState,
        threads: &mut ThreadTable,
        raw_policy: u32,
        quantum: i32,
    ) -> KernelResult<()> {
        if quantum <= 0 {
            return Err(KernelError::Invalid);
        }
        let policy = SchedPolicy::from_raw(raw_policy).ok_or(KernelError::Unsupported)?;

        let iflag = ints.begin_atomic();
        match policy {
            SchedPolicy::RoundRobin => {
                self.queues.collapse_into(0);
                for thread in threads.iter_mut() {
                    thread.current_level = 0;
                }
            }
            SchedPolicy::Mlf => {
                for thread in threads.iter_mut() {
                    if thread.priority == PRIORITY_IDLE {
                        self.queues.move_to(thread.pid, MAX_QUEUE_LEVEL - 1);
                        thread.current_level = MAX_QUEUE_LEVEL - 1;
                    }
                }
            }
        }
        self.policy = policy;
        self.quantum = quantum as u32;
        ints.end_atomic(iflag);
        Ok(())
    }

    /// Diagnostic line, as printed by the sys-info dump.
    pub fn info(&self) -> String {
        format!(
            "Scheduler algorithm {}, quantum {}, context switches {}\n",
            self.policy.name(),
            self.quantum,
            self.context_switches
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{PRIORITY_HIGH, PRIORITY_NORMAL};

    fn setup(policy: SchedPolicy) -> (IntState, ThreadTable, Scheduler) {
        (
            IntState::new(),
            ThreadTable::new(),
            Scheduler::new(policy, 4),
        )
    }

    fn spawn_runnable(
        ints: &mut IntState,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        prio: u32,
    ) -> Pid {
        let pid = threads.create(prio);
        sched.make_runnable_atomic(ints, threads.thread_mut(pid));
        pid
    }

    #[test]
    fn test_rr_prefers_priority_then_fifo() {
        let (mut ints, mut threads, mut sched) = setup(SchedPolicy::RoundRobin);
        let a = spawn_runnable(&mut ints, &mut threads, &mut sched, PRIORITY_NORMAL);
        let b = spawn_runnable(&mut ints, &mut threads, &mut sched, PRIORITY_HIGH);
        let c = spawn_runnable(&mut ints, &mut threads, &mut sched, PRIORITY_NORMAL);
        assert_eq!(sched.get_next_runnable(&threads), b);
        assert_eq!(sched.get_next_runnable(&threads), a);
        assert_eq!(sched.get_next_runnable(&threads), c);
        assert_eq!(sched.context_switches, 3);
    }

    #[test]
    fn test_mlf_promotion_on_wake() {
        let (mut ints, mut threads, mut sched) = setup(SchedPolicy::Mlf);
        let pid = threads.create(PRIORITY_NORMAL);
        let t = threads.thread_mut(pid);
        t.current_level = 2;
        t.blocked = true;
        sched.make_runnable_atomic(&mut ints, t);
        assert_eq!(threads.thread(pid).current_level, 1);
        assert!(!threads.thread(pid).blocked);
    }

    #[test]
    fn test_mlf_demotion_saturates() {
        let (_, mut threads, mut sched) = setup(SchedPolicy::Mlf);
        let pid = threads.create(PRIORITY_NORMAL);
        let t = threads.thread_mut(pid);
        for _ in 0..6 {
            sched.demote_for_full_quantum(t);
        }
        assert_eq!(t.current_level, MAX_QUEUE_LEVEL - 1);
    }

    #[test]
    fn test_switch_policy_validation() {
        let (mut ints, mut threads, mut sched) = setup(SchedPolicy::RoundRobin);
        assert_eq!(
            sched.switch_policy(&mut ints, &mut threads, 1, 0),
            Err(KernelError::Invalid)
        );
        assert_eq!(
            sched.switch_policy(&mut ints, &mut threads, 7, 4),
            Err(KernelError::Unsupported)
        );
        assert!(sched.switch_policy(&mut ints, &mut threads, 1, 4).is_ok());
        assert_eq!(sched.policy(), SchedPolicy::Mlf);
    }

    #[test]
    fn test_switch_to_rr_collapses_levels() {
        let (mut ints, mut threads, mut sched) = setup(SchedPolicy::Mlf);
        let pid = threads.create(PRIORITY_NORMAL);
        threads.thread_mut(pid).current_level = 3;
        sched.make_runnable_atomic(&mut ints, threads.thread_mut(pid));

        sched
            .switch_policy(&mut ints, &mut threads, 0, 2)
            .unwrap();
        assert_eq!(threads.thread(pid).current_level, 0);
        // now visible to RR dispatch
        assert_eq!(sched.get_next_runnable(&threads), pid);
    }

    #[test]
    fn test_switch_to_mlf_parks_idle_low() {
        let (mut ints, mut threads, mut sched) = setup(SchedPolicy::RoundRobin);
        let idle = spawn_runnable(&mut ints, &mut threads, &mut sched, PRIORITY_IDLE);
        let worker = spawn_runnable(&mut ints, &mut threads, &mut sched, PRIORITY_NORMAL);
        sched
            .switch_policy(&mut ints, &mut threads, 1, 4)
            .unwrap();
        assert_eq!(threads.thread(idle).current_level, MAX_QUEUE_LEVEL - 1);
        assert_eq!(sched.get_next_runnable(&threads), worker);
        assert_eq!(sched.get_next_runnable(&threads), idle);
    }

    #[test]
    #[should_panic(expected = "no runnable thread")]
    fn test_empty_dispatch_is_a_bug() {
        let (_, threads, mut sched) = setup(SchedPolicy::Mlf);
        sched.get_next_runnable(&threads);
    }
}
