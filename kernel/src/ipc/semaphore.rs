//! Counting semaphores
//!
//! A fixed table of named slots. Create-by-name either joins an
//! existing semaphore or claims a free slot; each create records a
//! membership on the calling thread, and only members may P, V or
//! destroy. P decrements and blocks while the count is negative; V
//! increments and, when the post-increment count is still no more than
//! zero, grants the wake to one waiter, whose parked P completes
//! without touching the count again.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sched::Exec;
use crate::sync::WaitQueue;

/// Longest semaphore name.
pub const MAX_SEM_NAME: usize = 25;

#[derive(Debug)]
struct Semaphore {
    /// Slot id + 1; zero marks a free slot.
    id: u32,
    name: String,
    count: i32,
    registered_users: u32,
    queue: WaitQueue,
}

impl Semaphore {
    fn free() -> Self {
        Self {
            id: 0,
            name: String::new(),
            count: 0,
            registered_users: 0,
            queue: WaitQueue::new(),
        }
    }
}

#[derive(Debug)]
pub struct SemaphoreTable {
    slots: Vec<Semaphore>,
}

impl SemaphoreTable {
    pub fn new(max_semaphores: usize) -> Self {
        Self {
            slots: (0..max_semaphores).map(|_| Semaphore::free()).collect(),
        }
    }

    fn slot(&mut self, id: u32) -> KernelResult<&mut Semaphore> {
        if id < 1 || id as usize > self.slots.len() {
            return Err(KernelError::Unspecified);
        }
        let sem = &mut self.slots[(id - 1) as usize];
        if sem.id == 0 {
            return Err(KernelError::Unspecified);
        }
        Ok(sem)
    }

    fn require_membership(exec: &mut Exec, id: u32) -> KernelResult<()> {
        if exec.current_thread().semaphores.contains(&id) {
            Ok(())
        } else {
            Err(KernelError::Unspecified)
        }
    }

    /// Create or join a semaphore by name; the caller becomes a member.
    pub fn create(&mut self, name: &str, initial: i32, exec: &mut Exec) -> KernelResult<u32> {
        if name.is_empty() || name.len() > MAX_SEM_NAME {
            return Err(KernelError::Invalid);
        }
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            if let Some(sem) = self.slots.iter_mut().find(|s| s.id != 0 && s.name == name) {
                sem.registered_users += 1;
                let id = sem.id;
                exec.current_thread().semaphores.push(id);
                log::debug!("sem: joined '{}' id={}", name, id);
                return Ok(id);
            }
            let at = self
                .slots
                .iter()
                .position(|s| s.id == 0)
                .ok_or(KernelError::Unspecified)?;
            let id = at as u32 + 1;
            self.slots[at] = Semaphore {
                id,
                name: String::from(name),
                count: initial,
                registered_users: 1,
                queue: WaitQueue::new(),
            };
            exec.current_thread().semaphores.push(id);
            log::debug!("sem: created '{}' id={} count={}", name, id, initial);
            Ok(id)
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// P (acquire): decrement, then block while the count is negative.
    /// A granted wake-up (see [`v`](Self::v)) completes immediately.
    pub fn p(&mut self, id: u32, exec: &mut Exec) -> KernelResult<()> {
        Self::require_membership(exec, id)?;
        if exec.current_thread().take_grant() {
            // the matching V already settled our decrement
            return Ok(());
        }
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let sem = self.slot(id)?;
            sem.count -= 1;
            if sem.count < 0 {
                Err(exec.block_on(&mut sem.queue))
            } else {
                Ok(())
            }
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// V (release): increment and hand the semaphore to one waiter if
    /// any are still accounted in the negative count.
    pub fn v(&mut self, id: u32, exec: &mut Exec) -> KernelResult<()> {
        Self::require_membership(exec, id)?;
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let sem = self.slot(id)?;
            sem.count += 1;
            if sem.count <= 0 {
                if let Some(pid) = exec.wake_one(&mut sem.queue) {
                    exec.threads.thread_mut(pid).sem_granted = true;
                }
            }
            Ok(())
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// Remove the calling thread's membership; the last member frees
    /// the slot.
    pub fn destroy(&mut self, id: u32, exec: &mut Exec) -> KernelResult<()> {
        Self::require_membership(exec, id)?;
        let iflag = exec.ints.begin_atomic();
        let result = (|| {
            let sem = self.slot(id)?;
            sem.registered_users -= 1;
            let empty = sem.registered_users == 0;

            let thread = exec.current_thread();
            if let Some(at) = thread.semaphores.iter().position(|&s| s == id) {
                thread.semaphores.remove(at);
            }

            if empty {
                log::debug!("sem: freed '{}' id={}", self.slots[(id - 1) as usize].name, id);
                self.slots[(id - 1) as usize] = Semaphore::free();
            }
            Ok(())
        })();
        exec.ints.end_atomic(iflag);
        result
    }

    /// Release every membership the exiting thread still holds.
    pub fn destroy_all_for_current(&mut self, exec: &mut Exec) {
        while let Some(&id) = exec.current_thread().semaphores.first() {
            // membership is re-checked inside; errors cannot happen for
            // ids taken off the thread's own list
            let _ = self.destroy(id, exec);
        }
    }

    pub fn waiters(&self, id: u32) -> usize {
        self.slots[(id - 1) as usize].queue.len()
    }

    pub fn count(&self, id: u32) -> i32 {
        self.slots[(id - 1) as usize].count
    }

    /// Diagnostic dump, one line per live slot.
    pub fn info(&self) -> String {
        let mut out = String::from("SemID RegUsr SemCount SemName\n");
        for sem in self.slots.iter().filter(|s| s.id != 0) {
            out.push_str(&format!(
                "{:5} {:6} {:8} {}\n",
                sem.id, sem.registered_users, sem.count, sem.name
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Pid, SchedPolicy, Scheduler, ThreadTable, PRIORITY_NORMAL};
    use crate::sync::IntState;

    struct Rig {
        ints: IntState,
        sched: Scheduler,
        threads: ThreadTable,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                ints: IntState::new(),
                sched: Scheduler::new(SchedPolicy::RoundRobin, 4),
                threads: ThreadTable::new(),
            }
        }

        fn spawn(&mut self) -> Pid {
            self.threads.create(PRIORITY_NORMAL)
        }

        fn exec_as(&mut self, pid: Pid) -> Exec<'_> {
            Exec {
                ints: &mut self.ints,
                sched: &mut self.sched,
                threads: &mut self.threads,
                current: pid,
                now: 0,
            }
        }
    }

    #[test]
    fn test_create_by_name_shares_slot() {
        let mut rig = Rig::new();
        let (a, b) = (rig.spawn(), rig.spawn());
        let mut sems = SemaphoreTable::new(4);
        let id1 = sems.create("mutex", 1, &mut rig.exec_as(a)).unwrap();
        let id2 = sems.create("mutex", 5, &mut rig.exec_as(b)).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(sems.count(id1), 1, "joining keeps the original count");
        assert_eq!(rig.threads.thread(a).semaphores, [id1]);
        assert_eq!(rig.threads.thread(b).semaphores, [id1]);
    }

    #[test]
    fn test_non_member_is_rejected() {
        let mut rig = Rig::new();
        let (member, outsider) = (rig.spawn(), rig.spawn());
        let mut sems = SemaphoreTable::new(4);
        let id = sems.create("s", 1, &mut rig.exec_as(member)).unwrap();
        assert_eq!(
            sems.p(id, &mut rig.exec_as(outsider)).unwrap_err(),
            KernelError::Unspecified
        );
        assert_eq!(
            sems.v(id, &mut rig.exec_as(outsider)).unwrap_err(),
            KernelError::Unspecified
        );
        assert_eq!(
            sems.destroy(id, &mut rig.exec_as(outsider)).unwrap_err(),
            KernelError::Unspecified
        );
    }

    #[test]
    fn test_p_blocks_and_v_grants() {
        let mut rig = Rig::new();
        let (a, b) = (rig.spawn(), rig.spawn());
        let mut sems = SemaphoreTable::new(4);
        let id = sems.create("mutex", 1, &mut rig.exec_as(a)).unwrap();
        let _ = sems.create("mutex", 1, &mut rig.exec_as(b)).unwrap();

        sems.p(id, &mut rig.exec_as(a)).unwrap();
        assert_eq!(sems.count(id), 0);

        // b contends and parks
        assert_eq!(
            sems.p(id, &mut rig.exec_as(b)).unwrap_err(),
            KernelError::WouldBlock
        );
        assert_eq!(sems.count(id), -1);
        assert!(rig.threads.thread(b).blocked);

        // a releases: b is granted and runnable, count settles at 0
        sems.v(id, &mut rig.exec_as(a)).unwrap();
        assert_eq!(sems.count(id), 0);
        assert!(rig.threads.thread(b).sem_granted);
        assert!(rig.sched.is_runnable(b));

        // the retried P completes without another decrement
        sems.p(id, &mut rig.exec_as(b)).unwrap();
        assert_eq!(sems.count(id), 0);

        sems.v(id, &mut rig.exec_as(b)).unwrap();
        assert_eq!(sems.count(id), 1);
    }

    #[test]
    fn test_destroy_frees_slot_at_last_member() {
        let mut rig = Rig::new();
        let (a, b) = (rig.spawn(), rig.spawn());
        let mut sems = SemaphoreTable::new(2);
        let id = sems.create("s", 0, &mut rig.exec_as(a)).unwrap();
        let _ = sems.create("s", 0, &mut rig.exec_as(b)).unwrap();

        sems.destroy(id, &mut rig.exec_as(a)).unwrap();
        assert!(rig.threads.thread(a).semaphores.is_empty());
        // still alive for b
        sems.v(id, &mut rig.exec_as(b)).unwrap();

        sems.destroy(id, &mut rig.exec_as(b)).unwrap();
        assert_eq!(
            sems.v(id, &mut rig.exec_as(b)).unwrap_err(),
            KernelError::Unspecified
        );

        // the slot is reusable under a new name
        let id2 = sems.create("other", 3, &mut rig.exec_as(a)).unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn test_exit_releases_memberships() {
        let mut rig = Rig::new();
        let a = rig.spawn();
        let mut sems = SemaphoreTable::new(4);
        let s1 = sems.create("one", 0, &mut rig.exec_as(a)).unwrap();
        let s2 = sems.create("two", 0, &mut rig.exec_as(a)).unwrap();
        sems.destroy_all_for_current(&mut rig.exec_as(a));
        assert!(rig.threads.thread(a).semaphores.is_empty());
        assert_eq!(
            sems.v(s1, &mut rig.exec_as(a)).unwrap_err(),
            KernelError::Unspecified
        );
        assert_eq!(
            sems.v(s2, &mut rig.exec_as(a)).unwrap_err(),
            KernelError::Unspecified
        );
    }

    #[test]
    fn test_table_exhaustion() {
        let mut rig = Rig::new();
        let a = rig.spawn();
        let mut sems = SemaphoreTable::new(1);
        sems.create("one", 0, &mut rig.exec_as(a)).unwrap();
        assert_eq!(
            sems.create("two", 0, &mut rig.exec_as(a)).unwrap_err(),
            KernelError::Unspecified
        );
    }
}
