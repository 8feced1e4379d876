//! Semaphore and message-queue syscalls

use super::{copy_out, user_bytes, user_string, Syscall, SyscallFrame};
use crate::error::{KernelError, KernelResult};
use crate::ipc::MAX_SEM_NAME;
use crate::kernel::Kernel;

/// Longest message-queue name accepted from user space.
const MAX_MQ_NAME: usize = 64;

pub(super) fn handle(k: &mut Kernel, call: Syscall, frame: &SyscallFrame) -> KernelResult<i32> {
    match call {
        Syscall::CreateSemaphore => {
            // names longer than the limit are truncated, not rejected
            let len = (frame.arg2 as usize).min(MAX_SEM_NAME);
            let name = user_string(k, frame.arg1, len, MAX_SEM_NAME)?;
            k.sem_create(&name, frame.arg3 as i32).map(|id| id as i32)
        }
        Syscall::P => {
            k.sem_p(frame.arg1)?;
            Ok(0)
        }
        Syscall::V => {
            k.sem_v(frame.arg1)?;
            Ok(0)
        }
        Syscall::DestroySemaphore => {
            k.sem_destroy(frame.arg1)?;
            Ok(0)
        }
        Syscall::MqCreate => {
            let name = user_string(k, frame.arg1, frame.arg2 as usize, MAX_MQ_NAME)?;
            k.mq_create(&name, frame.arg3 as usize).map(|id| id as i32)
        }
        Syscall::MqDestroy => {
            k.mq_destroy(frame.arg1)?;
            Ok(0)
        }
        Syscall::MqSend => {
            let payload = user_bytes(k, frame.arg2, frame.arg3 as usize)?;
            k.mq_send(frame.arg1, &payload)?;
            Ok(0)
        }
        Syscall::MqReceive => {
            let payload = k.mq_receive(frame.arg1)?;
            let n = payload.len().min(frame.arg3 as usize);
            copy_out(k, frame.arg2, &payload[..n])?;
            Ok(n as i32)
        }
        _ => Err(KernelError::Invalid),
    }
}
