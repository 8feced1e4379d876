//! The kernel composition root
//!
//! `Kernel` owns every subsystem and drives the machine model: the
//! timer tick, thread dispatch, process spawn/exit/join, and the typed
//! operation surface the syscall layer (and tests) call into. A fresh
//! `Kernel` is a fully initialized machine with an idle thread; drop
//! tears everything down.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{KernelConfig, SECTORS_PER_PAGE, USER_BASE};
use crate::error::{KernelError, KernelResult};
use crate::fs::console::{ConsFs, Console};
use crate::fs::file::{File, FileCx, OpenMode};
use crate::fs::gosfs::GosfsFsOps;
use crate::fs::pipe::Pipe;
use crate::fs::{FileStat, Vfs, VfsDirEntry};
use crate::ipc::{MqRegistry, SemaphoreTable};
use crate::loader::{FlatLoader, Loader};
use crate::mm::{FaultCode, FaultOutcome, PageFile, PteFlags, Vm, USER_ARG_PAGE};
use crate::sched::{
    Exec, Pid, Priority, SchedPolicy, Scheduler, ThreadTable, PRIORITY_IDLE, PRIORITY_USER,
};
use crate::sync::IntState;
use crate::syscall::{self, SyscallFrame, SyscallOutcome};

/// Build an [`Exec`] over a kernel's scheduling fields without
/// borrowing the rest of it, so callers can hold `vm`/`vfs`/... at the
/// same time.
macro_rules! kexec {
    ($k:expr) => {
        Exec {
            ints: &mut $k.ints,
            sched: &mut $k.sched,
            threads: &mut $k.threads,
            current: $k.current,
            now: $k.ticks,
        }
    };
}

pub struct Kernel {
    pub config: KernelConfig,
    pub ticks: u64,
    pub ints: IntState,
    pub threads: ThreadTable,
    pub sched: Scheduler,
    pub vm: Vm,
    pub vfs: Vfs,
    pub console: Console,
    pub mqueues: MqRegistry,
    pub semaphores: SemaphoreTable,
    pub loader: Box<dyn Loader>,
    current: Pid,
    idle: Pid,
}

impl Kernel {
    /// Bring the machine up: devices, page file, VM, filesystem types,
    /// IPC tables, and the idle thread (initially running).
    pub fn new(config: KernelConfig) -> Self {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(
            "gosfs",
            Box::new(GosfsFsOps {
                cache_size: config.buffer_cache_size,
            }),
        );
        vfs.register_filesystem("consfs", Box::new(ConsFs));

        let paging_sectors = (config.page_file_pages * SECTORS_PER_PAGE) as u64;
        let paging_dev = vfs
            .devices
            .register("paging", paging_sectors)
            .expect("paging device registration");
        let page_file = PageFile::new(paging_dev, 0, config.page_file_pages);
        let vm = Vm::new(config.num_frames, page_file, config.user_max_files);

        // the boot policy is round-robin, so the idle thread starts on
        // level 0 like everything else; switching to MLF parks it on
        // the last level
        let mut threads = ThreadTable::new();
        let idle = threads.create(PRIORITY_IDLE);

        let mqueues = MqRegistry::new(config.max_message_size);
        let semaphores = SemaphoreTable::new(config.max_semaphores);
        let sched = Scheduler::new(SchedPolicy::RoundRobin, config.quantum);

        log::info!(
            "kernel up: {} frames, {} page-file slots, quantum {}",
            config.num_frames,
            config.page_file_pages,
            config.quantum
        );
        Self {
            config,
            ticks: 0,
            ints: IntState::new(),
            threads,
            sched,
            vm,
            vfs,
            console: Console::new(),
            mqueues,
            semaphores,
            loader: Box::new(FlatLoader),
            current: idle,
            idle,
        }
    }

    /// Flush filesystems and stop. The explicit counterpart to `new`.
    pub fn shutdown(&mut self) -> KernelResult<()> {
        self.vfs.sync_all(&mut kexec!(self))
    }

    // =======================================================================
    // Threads, dispatch, time
    // =======================================================================

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn idle_thread(&self) -> Pid {
        self.idle
    }

    pub fn current_euid(&self) -> u32 {
        self.threads
            .get(self.current)
            .and_then(|t| t.context)
            .and_then(|ctx| self.vm.contexts.get(ctx))
            .map(|ctx| ctx.euid)
            .unwrap_or(0)
    }

    /// Start a pure kernel thread (no user context), ready to run.
    pub fn spawn_kernel_thread(&mut self, priority: Priority) -> Pid {
        let pid = self.threads.create(priority);
        self.sched
            .make_runnable_atomic(&mut self.ints, self.threads.thread_mut(pid));
        pid
    }

    /// Requeue the running thread (demoting it when its quantum is
    /// spent) and switch to the scheduler's choice.
    pub fn dispatch(&mut self) -> Pid {
        let cur = self.current;
        let quantum = self.sched.quantum();
        if let Some(thread) = self.threads.get_mut(cur) {
            if thread.alive && !thread.blocked && !self.sched.is_runnable(cur) {
                if thread.quantum_used >= quantum {
                    self.sched.demote_for_full_quantum(thread);
                }
                self.sched.make_runnable_atomic(&mut self.ints, thread);
            }
        }
        let next = self.sched.get_next_runnable(&self.threads);
        self.threads.thread_mut(next).quantum_used = 0;
        self.current = next;
        next
    }

    /// Voluntarily give up the CPU without burning the quantum.
    pub fn yield_now(&mut self) -> Pid {
        self.threads.thread_mut(self.current).quantum_used = 0;
        self.dispatch()
    }

    /// One timer tick: advance the clock, run the page cleaner, charge
    /// the running thread, and preempt it when the quantum is spent.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.vm.now = self.ticks;

        let iflag = self.ints.begin_atomic();
        self.vm.page_cleaner(&self.ints);
        self.ints.end_atomic(iflag);

        let quantum = self.sched.quantum();
        let thread = self.threads.thread_mut(self.current);
        thread.quantum_used += 1;
        if thread.quantum_used >= quantum {
            self.dispatch();
        }
    }

    /// Terminate the running thread: memberships released, context
    /// dropped (files closed, space freed at last reference), joiners
    /// woken, next thread dispatched.
    pub fn exit(&mut self, code: i32) -> Pid {
        let pid = self.current;
        assert_ne!(pid, self.idle, "the idle thread never exits");
        log::debug!("thread {} exits with code {}", pid, code);

        self.semaphores.destroy_all_for_current(&mut kexec!(self));

        let ctx_id = self.threads.thread_mut(pid).context.take();
        if let Some(ctx_id) = ctx_id {
            let ctx = self.vm.contexts.ctx_mut(ctx_id);
            ctx.ref_count -= 1;
            if ctx.ref_count == 0 {
                let files = self.vm.free_address_space(&mut self.ints, ctx_id);
                let mut exec = kexec!(self);
                for file in files.into_iter().flatten() {
                    let _ = file.close(&mut exec);
                }
            }
        }

        {
            let thread = self.threads.thread_mut(pid);
            thread.alive = false;
            thread.exit_code = code;
            let mut joiners = core::mem::take(&mut thread.join_queue);
            kexec!(self).wake_all(&mut joiners);
        }
        self.sched.unlink(pid);
        self.dispatch()
    }

    /// Join: block until `target` exits, then reap it and return its
    /// exit code.
    pub fn wait(&mut self, target: Pid) -> KernelResult<i32> {
        if target == self.current || target == self.idle {
            return Err(KernelError::Invalid);
        }
        let alive = match self.threads.get(target) {
            Some(t) => t.alive,
            None => return Err(KernelError::Invalid),
        };
        if alive {
            let mut exec = kexec!(self);
            let mut queue = core::mem::take(&mut exec.threads.thread_mut(target).join_queue);
            let err = exec.block_on(&mut queue);
            exec.threads.thread_mut(target).join_queue = queue;
            return Err(err);
        }
        let thread = self.threads.remove(target).expect("reaped twice");
        Ok(thread.exit_code)
    }

    /// Load an executable from the VFS and start it as a user process.
    /// A setuid binary runs with its owner's uid.
    pub fn spawn(&mut self, path: &str, command: &str) -> KernelResult<Pid> {
        let euid = self.current_euid();
        let stat = self.vfs.stat(path, euid, &mut kexec!(self))?;
        let mut exe_file = self.vfs.open(path, OpenMode::READ, euid, &mut kexec!(self))?;

        let mut image = alloc::vec![0u8; stat.size as usize];
        let mut read = 0;
        while read < image.len() {
            let n = self.file_read(&mut exe_file, &mut image[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        self.file_close(exe_file)?;
        image.truncate(read);

        let exe = self.loader.parse(&image).map_err(|_| KernelError::NoExec)?;

        let ctx_id = self.vm.create_context(&mut self.ints, exe.span())?;
        let populated = (|| -> KernelResult<()> {
            for seg in &exe.segments {
                if !self.vm.copy_to_user(&mut self.ints, ctx_id, seg.vaddr, &seg.data) {
                    return Err(KernelError::NoExec);
                }
            }
            let block = crate::mm::format_arg_block(command, USER_ARG_PAGE)?;
            if !self.vm.copy_to_user(&mut self.ints, ctx_id, USER_ARG_PAGE, &block) {
                return Err(KernelError::NoExec);
            }
            Ok(())
        })();
        if let Err(e) = populated {
            self.vm.contexts.ctx_mut(ctx_id).ref_count = 0;
            let _ = self.vm.free_address_space(&mut self.ints, ctx_id);
            return Err(e);
        }

        // the image is in place; seal read-only segments
        for seg in &exe.segments {
            if !seg.writable {
                self.vm.write_protect(ctx_id, seg.vaddr, seg.data.len());
            }
        }

        {
            let ctx = self.vm.contexts.ctx_mut(ctx_id);
            ctx.entry_addr = exe.entry;
            ctx.euid = if stat.is_setuid { stat.acls[0].uid } else { euid };
            ctx.ref_count = 1;
        }

        let pid = self.threads.create(PRIORITY_USER);
        self.threads.thread_mut(pid).context = Some(ctx_id);
        self.sched
            .make_runnable_atomic(&mut self.ints, self.threads.thread_mut(pid));
        log::debug!("spawned '{}' as pid {}", path, pid);
        Ok(pid)
    }

    /// Simulate a user-mode access at `uaddr`, faulting the way the
    /// MMU would: a missing page raises a not-present fault, a store
    /// to a present page without write permission raises a protection
    /// violation, and a permitted access to a present page raises
    /// nothing. Unresolvable faults kill the process, as the handler
    /// dictates.
    pub fn user_page_fault(&mut self, uaddr: u32, write: bool) -> FaultOutcome {
        let ctx = self
            .threads
            .thread(self.current)
            .context
            .expect("user fault without user context");
        let linear = USER_BASE.wrapping_add(uaddr);

        let (present, writable) = match self.vm.contexts.ctx(ctx).dir.pte(linear) {
            Some(pte) if pte.present => (true, pte.flags.contains(PteFlags::WRITE)),
            _ => (false, false),
        };
        if present && (!write || writable) {
            return FaultOutcome::Resolved;
        }

        let iflag = self.ints.begin_atomic();
        let outcome = self.vm.handle_page_fault(
            &mut self.ints,
            ctx,
            linear,
            FaultCode {
                protection: present,
                write,
                user_mode: true,
            },
        );
        self.ints.end_atomic(iflag);
        if outcome == FaultOutcome::TerminateProcess {
            self.exit(-1);
        }
        outcome
    }

    // =======================================================================
    // Scheduling & paging controls
    // =======================================================================

    pub fn set_scheduling_policy(&mut self, policy: u32, quantum: i32) -> KernelResult<()> {
        self.sched
            .switch_policy(&mut self.ints, &mut self.threads, policy, quantum)
    }

    pub fn select_paging_algorithm(&mut self, alg: u32) -> KernelResult<()> {
        self.vm.select_algorithm(alg)
    }

    pub fn get_time_of_day(&self) -> u64 {
        self.ticks
    }

    pub fn sbrk(&mut self, increment: i32) -> KernelResult<u32> {
        let ctx = self
            .threads
            .thread(self.current)
            .context
            .ok_or(KernelError::Invalid)?;
        self.vm.sbrk(ctx, increment)
    }

    pub fn set_effective_uid(&mut self, uid: u32) -> KernelResult<()> {
        if self.current_euid() != 0 {
            return Err(KernelError::Access);
        }
        let ctx = self
            .threads
            .thread(self.current)
            .context
            .ok_or(KernelError::Invalid)?;
        self.vm.contexts.ctx_mut(ctx).euid = uid;
        Ok(())
    }

    // =======================================================================
    // Filesystem surface
    // =======================================================================

    pub fn format(&mut self, devname: &str, fstype: &str) -> KernelResult<()> {
        self.vfs.format(devname, fstype, &mut kexec!(self))
    }

    pub fn mount(&mut self, devname: &str, prefix: &str, fstype: &str) -> KernelResult<()> {
        self.vfs.mount(devname, prefix, fstype, &mut kexec!(self))
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> KernelResult<File> {
        let euid = self.current_euid();
        self.vfs.open(path, mode, euid, &mut kexec!(self))
    }

    pub fn open_directory(&mut self, path: &str) -> KernelResult<File> {
        self.vfs.open_directory(path, &mut kexec!(self))
    }

    pub fn create_directory(&mut self, path: &str) -> KernelResult<()> {
        let euid = self.current_euid();
        self.vfs.create_directory(path, euid, &mut kexec!(self))
    }

    pub fn stat(&mut self, path: &str) -> KernelResult<FileStat> {
        let euid = self.current_euid();
        self.vfs.stat(path, euid, &mut kexec!(self))
    }

    pub fn delete(&mut self, path: &str) -> KernelResult<()> {
        let euid = self.current_euid();
        self.vfs.delete(path, euid, &mut kexec!(self))
    }

    pub fn sync(&mut self) -> KernelResult<()> {
        self.vfs.sync_all(&mut kexec!(self))
    }

    pub fn set_acl(&mut self, path: &str, uid: u32, perms: u32) -> KernelResult<()> {
        let euid = self.current_euid();
        self.vfs.set_acl(path, uid, perms, euid, &mut kexec!(self))
    }

    pub fn set_setuid(&mut self, path: &str, flag: bool) -> KernelResult<()> {
        let euid = self.current_euid();
        self.vfs.set_setuid(path, flag, euid, &mut kexec!(self))
    }

    pub fn file_read(&mut self, file: &mut File, buf: &mut [u8]) -> KernelResult<usize> {
        let mut exec = kexec!(self);
        let mut cx = FileCx {
            exec: &mut exec,
            console: &mut self.console,
        };
        file.read(buf, &mut cx)
    }

    pub fn file_write(&mut self, file: &mut File, buf: &[u8]) -> KernelResult<usize> {
        let mut exec = kexec!(self);
        let mut cx = FileCx {
            exec: &mut exec,
            console: &mut self.console,
        };
        file.write(buf, &mut cx)
    }

    pub fn file_seek(&mut self, file: &mut File, pos: u64) -> KernelResult<()> {
        file.seek(pos)
    }

    pub fn file_stat(&mut self, file: &File) -> KernelResult<FileStat> {
        file.fstat(&mut kexec!(self))
    }

    pub fn read_entry(&mut self, file: &mut File) -> KernelResult<Option<VfsDirEntry>> {
        file.read_entry()
    }

    pub fn clone_file(&mut self, file: &File) -> KernelResult<File> {
        file.clone_file(&mut kexec!(self))
    }

    pub fn file_close(&mut self, file: File) -> KernelResult<()> {
        file.close(&mut kexec!(self))
    }

    pub fn create_pipe(&mut self) -> (File, File) {
        Pipe::create()
    }

    // =======================================================================
    // IPC surface
    // =======================================================================

    pub fn sem_create(&mut self, name: &str, initial: i32) -> KernelResult<u32> {
        self.semaphores.create(name, initial, &mut kexec!(self))
    }

    pub fn sem_p(&mut self, id: u32) -> KernelResult<()> {
        self.semaphores.p(id, &mut kexec!(self))
    }

    pub fn sem_v(&mut self, id: u32) -> KernelResult<()> {
        self.semaphores.v(id, &mut kexec!(self))
    }

    pub fn sem_destroy(&mut self, id: u32) -> KernelResult<()> {
        self.semaphores.destroy(id, &mut kexec!(self))
    }

    pub fn mq_create(&mut self, name: &str, capacity: usize) -> KernelResult<u32> {
        self.mqueues.create(name, capacity, &mut kexec!(self))
    }

    pub fn mq_destroy(&mut self, id: u32) -> KernelResult<()> {
        self.mqueues.destroy(id, &mut kexec!(self))
    }

    pub fn mq_send(&mut self, id: u32, payload: &[u8]) -> KernelResult<()> {
        self.mqueues.send(id, payload, &mut kexec!(self))
    }

    pub fn mq_receive(&mut self, id: u32) -> KernelResult<Vec<u8>> {
        self.mqueues.receive(id, &mut kexec!(self))
    }

    // =======================================================================
    // Console & diagnostics
    // =======================================================================

    pub fn push_keys(&mut self, keys: &[u8]) {
        self.console.push_keys(keys, &mut kexec!(self));
    }

    pub fn get_key(&mut self) -> KernelResult<u8> {
        self.console.get_key(&mut kexec!(self))
    }

    pub fn print_string(&mut self, s: &str) {
        self.console.put_str(s);
    }

    /// One line per thread, as the process-list syscall prints it.
    pub fn process_list(&self) -> String {
        let mut out = String::from("PID PRIO LEVEL BLOCKED ALIVE\n");
        for thread in self.threads.iter() {
            out.push_str(&format!(
                "{:3} {:4} {:5} {:7} {:5}\n",
                thread.pid,
                thread.priority,
                thread.current_level,
                thread.blocked as u8,
                thread.alive as u8
            ));
        }
        out
    }

    /// The sys-info dump; `flags` selects sections (0 means all).
    pub fn sys_info(&self, flags: u32) -> String {
        let mut out = String::new();
        if flags == 0 || flags & 0x1 != 0 {
            out.push_str(&self.sched.info());
        }
        if flags == 0 || flags & 0x2 != 0 {
            out.push_str(&self.vm.paging_info());
        }
        if flags == 0 || flags & 0x4 != 0 {
            out.push_str(&self.mqueues.info());
        }
        if flags == 0 || flags & 0x8 != 0 {
            out.push_str(&self.semaphores.info());
        }
        out
    }

    // =======================================================================
    // Syscall entry
    // =======================================================================

    /// Dispatch one trap frame for the running thread. `Blocked` means
    /// the thread was parked and the frame recorded for retry.
    pub fn syscall(&mut self, frame: SyscallFrame) -> SyscallOutcome {
        syscall::dispatch(self, frame)
    }

    /// Re-issue the running thread's parked syscall, if any.
    pub fn retry_pending(&mut self) -> Option<SyscallOutcome> {
        let pending = self.threads.thread_mut(self.current).pending.take()?;
        Some(self.syscall(pending.frame))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
