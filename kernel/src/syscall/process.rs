//! Process, scheduling, console and diagnostic syscalls

use super::{copy_out, user_bytes, user_string, Syscall, SyscallFrame};
use crate::error::{KernelError, KernelResult};
use crate::fs::VFS_MAX_PATH_LEN;
use crate::kernel::Kernel;

/// Longest command line accepted by spawn.
const MAX_COMMAND_LEN: usize = 1024;

pub(super) fn handle(k: &mut Kernel, call: Syscall, frame: &SyscallFrame) -> KernelResult<i32> {
    match call {
        Syscall::PrintString => {
            let bytes = user_bytes(k, frame.arg1, frame.arg2 as usize)?;
            k.console.put_bytes(&bytes);
            Ok(0)
        }
        Syscall::GetKey => k.get_key().map(|key| key as i32),
        Syscall::SetAttr => {
            k.console.set_attr(frame.arg1 as u8);
            Ok(0)
        }
        Syscall::GetCursor => {
            let (row, col) = k.console.cursor();
            copy_out(k, frame.arg1, &row.to_le_bytes())?;
            copy_out(k, frame.arg2, &col.to_le_bytes())?;
            Ok(0)
        }
        Syscall::PutCursor => {
            k.console.set_cursor(frame.arg1, frame.arg2)?;
            Ok(0)
        }
        Syscall::Spawn => {
            let path = user_string(k, frame.arg1, frame.arg2 as usize, VFS_MAX_PATH_LEN)?;
            let command = user_string(k, frame.arg3, frame.arg4 as usize, MAX_COMMAND_LEN)?;
            k.spawn(&path, &command).map(|pid| pid as i32)
        }
        Syscall::Wait => k.wait(frame.arg1),
        Syscall::GetPid => Ok(k.current() as i32),
        Syscall::SetSchedulingPolicy => {
            k.set_scheduling_policy(frame.arg1, frame.arg2 as i32)?;
            Ok(0)
        }
        Syscall::GetTimeOfDay => Ok(k.get_time_of_day() as i32),
        Syscall::PrintProcessList => {
            let listing = k.process_list();
            k.console.put_str(&listing);
            Ok(0)
        }
        Syscall::PrintSysInfo => {
            let info = k.sys_info(frame.arg1);
            k.console.put_str(&info);
            Ok(0)
        }
        Syscall::SelectPagingAlgorithm => {
            k.select_paging_algorithm(frame.arg1)?;
            Ok(0)
        }
        Syscall::Sbrk => k.sbrk(frame.arg1 as i32).map(|old| old as i32),
        Syscall::SetEffectiveUid => {
            k.set_effective_uid(frame.arg1)?;
            Ok(0)
        }
        Syscall::GetUid => Ok(k.current_euid() as i32),
        _ => Err(KernelError::Invalid),
    }
}
