//! System-call dispatch
//!
//! Traps arrive as a register frame: the call number plus four
//! argument registers. The dispatcher validates the number, hands the
//! frame to the area handler, and turns the result into the integer
//! convention: non-negative success, negative taxonomy code. A handler
//! returning `WouldBlock` means the calling thread was parked; the
//! frame is recorded on its TCB and re-issued when it runs again.

mod filesystem;
mod ipc;
mod process;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::mm::CtxId;

/// The trap-register frame.
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    pub num: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
    pub arg4: u32,
}

impl SyscallFrame {
    pub fn new(num: u32, args: [u32; 4]) -> Self {
        Self {
            num,
            arg1: args[0],
            arg2: args[1],
            arg3: args[2],
            arg4: args[3],
        }
    }
}

/// A syscall parked on a blocked thread, re-issued on wake-up.
#[derive(Debug, Clone, Copy)]
pub struct PendingSyscall {
    pub frame: SyscallFrame,
}

/// What a trap produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// The call finished; the value goes back in the return register.
    Complete(i32),
    /// The thread suspended; the frame was recorded for retry.
    Blocked,
}

/// System call numbers. The order is the ABI and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Null = 0,
    Exit = 1,
    PrintString = 2,
    GetKey = 3,
    SetAttr = 4,
    GetCursor = 5,
    PutCursor = 6,
    Spawn = 7,
    Wait = 8,
    GetPid = 9,
    SetSchedulingPolicy = 10,
    GetTimeOfDay = 11,
    CreateSemaphore = 12,
    P = 13,
    V = 14,
    DestroySemaphore = 15,
    PrintProcessList = 16,
    PrintSysInfo = 17,
    SelectPagingAlgorithm = 18,
    Mount = 19,
    Open = 20,
    OpenDirectory = 21,
    Close = 22,
    Delete = 23,
    Read = 24,
    ReadEntry = 25,
    Write = 26,
    Stat = 27,
    Fstat = 28,
    Seek = 29,
    CreateDir = 30,
    Sync = 31,
    Format = 32,
    CreatePipe = 33,
    MqCreate = 34,
    MqDestroy = 35,
    MqSend = 36,
    MqReceive = 37,
    Sbrk = 38,
    SetAcl = 39,
    SetSetuid = 40,
    SetEffectiveUid = 41,
    GetUid = 42,
}

impl Syscall {
    pub fn from_num(num: u32) -> Option<Self> {
        if num <= Self::GetUid as u32 {
            // the numbering is dense; transmute-free decode via match
            Some(match num {
                0 => Self::Null,
                1 => Self::Exit,
                2 => Self::PrintString,
                3 => Self::GetKey,
                4 => Self::SetAttr,
                5 => Self::GetCursor,
                6 => Self::PutCursor,
                7 => Self::Spawn,
                8 => Self::Wait,
                9 => Self::GetPid,
                10 => Self::SetSchedulingPolicy,
                11 => Self::GetTimeOfDay,
                12 => Self::CreateSemaphore,
                13 => Self::P,
                14 => Self::V,
                15 => Self::DestroySemaphore,
                16 => Self::PrintProcessList,
                17 => Self::PrintSysInfo,
                18 => Self::SelectPagingAlgorithm,
                19 => Self::Mount,
                20 => Self::Open,
                21 => Self::OpenDirectory,
                22 => Self::Close,
                23 => Self::Delete,
                24 => Self::Read,
                25 => Self::ReadEntry,
                26 => Self::Write,
                27 => Self::Stat,
                28 => Self::Fstat,
                29 => Self::Seek,
                30 => Self::CreateDir,
                31 => Self::Sync,
                32 => Self::Format,
                33 => Self::CreatePipe,
                34 => Self::MqCreate,
                35 => Self::MqDestroy,
                36 => Self::MqSend,
                37 => Self::MqReceive,
                38 => Self::Sbrk,
                39 => Self::SetAcl,
                40 => Self::SetSetuid,
                41 => Self::SetEffectiveUid,
                _ => Self::GetUid,
            })
        } else {
            None
        }
    }
}

/// Dispatch one trap for the running thread.
pub(crate) fn dispatch(k: &mut Kernel, frame: SyscallFrame) -> SyscallOutcome {
    let call = match Syscall::from_num(frame.num) {
        Some(call) => call,
        None => {
            log::warn!("bad syscall number {}", frame.num);
            return SyscallOutcome::Complete(KernelError::Invalid.code());
        }
    };

    let result = match call {
        Syscall::Null => Ok(0),
        Syscall::Exit => {
            k.exit(frame.arg1 as i32);
            Ok(0)
        }
        Syscall::PrintString
        | Syscall::GetKey
        | Syscall::SetAttr
        | Syscall::GetCursor
        | Syscall::PutCursor
        | Syscall::Spawn
        | Syscall::Wait
        | Syscall::GetPid
        | Syscall::SetSchedulingPolicy
        | Syscall::GetTimeOfDay
        | Syscall::PrintProcessList
        | Syscall::PrintSysInfo
        | Syscall::SelectPagingAlgorithm
        | Syscall::Sbrk
        | Syscall::SetEffectiveUid
        | Syscall::GetUid => process::handle(k, call, &frame),
        Syscall::Mount
        | Syscall::Open
        | Syscall::OpenDirectory
        | Syscall::Close
        | Syscall::Delete
        | Syscall::Read
        | Syscall::ReadEntry
        | Syscall::Write
        | Syscall::Stat
        | Syscall::Fstat
        | Syscall::Seek
        | Syscall::CreateDir
        | Syscall::Sync
        | Syscall::Format
        | Syscall::CreatePipe => filesystem::handle(k, call, &frame),
        Syscall::CreateSemaphore
        | Syscall::P
        | Syscall::V
        | Syscall::DestroySemaphore
        | Syscall::MqCreate
        | Syscall::MqDestroy
        | Syscall::MqSend
        | Syscall::MqReceive => ipc::handle(k, call, &frame),
        Syscall::SetAcl | Syscall::SetSetuid => filesystem::handle(k, call, &frame),
    };

    match result {
        Ok(value) => SyscallOutcome::Complete(value),
        Err(KernelError::WouldBlock) => {
            let pid = k.current();
            k.threads.thread_mut(pid).pending = Some(PendingSyscall { frame });
            SyscallOutcome::Blocked
        }
        Err(e) => SyscallOutcome::Complete(e.code()),
    }
}

// ===========================================================================
// Marshalling helpers
// ===========================================================================

/// Per-syscall ceiling on user buffer transfers.
const MAX_TRANSFER: usize = 1 << 20;

fn current_ctx(k: &Kernel) -> Result<CtxId, KernelError> {
    k.threads
        .thread(k.current())
        .context
        .ok_or(KernelError::Invalid)
}

/// Bounded copy of a user buffer into kernel memory.
fn user_bytes(k: &mut Kernel, addr: u32, len: usize) -> Result<alloc::vec::Vec<u8>, KernelError> {
    if len > MAX_TRANSFER {
        return Err(KernelError::NoMem);
    }
    let ctx = current_ctx(k)?;
    let mut buf = alloc::vec![0u8; len];
    if !k.vm.copy_from_user(&mut k.ints, ctx, &mut buf, addr) {
        return Err(KernelError::Unspecified);
    }
    Ok(buf)
}

/// Bounded copy of a NUL-free user string (for paths and names).
fn user_string(
    k: &mut Kernel,
    addr: u32,
    len: usize,
    max: usize,
) -> Result<alloc::string::String, KernelError> {
    if len > max {
        return Err(KernelError::NameTooLong);
    }
    let bytes = user_bytes(k, addr, len)?;
    alloc::string::String::from_utf8(bytes).map_err(|_| KernelError::Invalid)
}

/// Copy kernel bytes out to user memory.
fn copy_out(k: &mut Kernel, addr: u32, data: &[u8]) -> Result<(), KernelError> {
    let ctx = current_ctx(k)?;
    if !k.vm.copy_to_user(&mut k.ints, ctx, addr, data) {
        return Err(KernelError::Unspecified);
    }
    Ok(())
}

/// Run `f` on an open file slot, keeping the slot consistent even when
/// the operation parks the thread (the retry takes the file again).
fn with_fd<R>(
    k: &mut Kernel,
    fd: usize,
    f: impl FnOnce(&mut Kernel, &mut crate::fs::file::File) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    let ctx = current_ctx(k)?;
    let mut file = k
        .vm
        .contexts
        .ctx_mut(ctx)
        .files
        .get_mut(fd)
        .and_then(Option::take)
        .ok_or(KernelError::Invalid)?;
    let result = f(k, &mut file);
    k.vm.contexts.ctx_mut(ctx).files[fd] = Some(file);
    result
}
