//! The register-based trap ABI, driven from a spawned user process:
//! argument marshalling through user memory, fd-based file I/O, and
//! the error taxonomy on the wire.

use gossamer_kernel::config::PAGE_SIZE;
use gossamer_kernel::fs::file::OpenMode;
use gossamer_kernel::syscall::Syscall;
use gossamer_kernel::{Kernel, KernelConfig, KernelError, SyscallFrame, SyscallOutcome};

/// A machine with a formatted volume, a mounted console, and a running
/// user process.
fn machine() -> (Kernel, u32) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut k = Kernel::new(KernelConfig::default());
    k.vfs.devices.register("ide0", 8192).unwrap();
    k.format("ide0", "gosfs").unwrap();
    k.mount("ide0", "c", "gosfs").unwrap();
    k.mount("none", "d", "consfs").unwrap();

    let mut init = k
        .open("/c/init", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    k.file_write(&mut init, &[0x90u8; 32]).unwrap();
    k.file_close(init).unwrap();
    let pid = k.spawn("/c/init", "init one two").unwrap();
    assert_eq!(k.dispatch(), pid);
    (k, pid)
}

/// Plant a string in the process's image region and return its user
/// address.
fn plant(k: &mut Kernel, at: u32, s: &str) -> (u32, u32) {
    let ctx = k.threads.thread(k.current()).context.unwrap();
    assert!(k.vm.copy_to_user(&mut k.ints, ctx, at, s.as_bytes()));
    (at, s.len() as u32)
}

fn complete(k: &mut Kernel, frame: SyscallFrame) -> i32 {
    match k.syscall(frame) {
        SyscallOutcome::Complete(v) => v,
        SyscallOutcome::Blocked => panic!("syscall unexpectedly blocked"),
    }
}

#[test]
fn pid_uid_and_time_roundtrip() {
    let (mut k, pid) = machine();
    let got = complete(&mut k, SyscallFrame::new(Syscall::GetPid as u32, [0; 4]));
    assert_eq!(got, pid as i32);
    let uid = complete(&mut k, SyscallFrame::new(Syscall::GetUid as u32, [0; 4]));
    assert_eq!(uid, 0);
    k.tick();
    let t = complete(
        &mut k,
        SyscallFrame::new(Syscall::GetTimeOfDay as u32, [0; 4]),
    );
    assert_eq!(t, 1);
}

#[test]
fn open_write_read_close_via_traps() {
    let (mut k, _) = machine();
    let scratch = PAGE_SIZE as u32 + 2048;
    let (path, path_len) = plant(&mut k, scratch, "/c/notes.txt");

    let mode = (OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE).bits();
    let fd = complete(
        &mut k,
        SyscallFrame::new(Syscall::Open as u32, [path, path_len, mode, 0]),
    );
    assert!(fd >= 0, "open returned {}", fd);

    let (data, data_len) = plant(&mut k, scratch + 64, "hello trap");
    let wrote = complete(
        &mut k,
        SyscallFrame::new(Syscall::Write as u32, [fd as u32, data, data_len, 0]),
    );
    assert_eq!(wrote, 10);

    // rewind and read back through user memory
    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::Seek as u32, [fd as u32, 0, 0, 0])
        ),
        0
    );
    let readback_at = scratch + 256;
    let n = complete(
        &mut k,
        SyscallFrame::new(Syscall::Read as u32, [fd as u32, readback_at, 10, 0]),
    );
    assert_eq!(n, 10);
    let ctx = k.threads.thread(k.current()).context.unwrap();
    let mut back = [0u8; 10];
    assert!(k.vm.copy_from_user(&mut k.ints, ctx, &mut back, readback_at));
    assert_eq!(&back, b"hello trap");

    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::Close as u32, [fd as u32, 0, 0, 0])
        ),
        0
    );
    // double close is invalid
    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::Close as u32, [fd as u32, 0, 0, 0])
        ),
        KernelError::Invalid.code()
    );
}

#[test]
fn errors_travel_as_negative_codes() {
    let (mut k, _) = machine();
    let scratch = PAGE_SIZE as u32 + 2048;
    let (path, len) = plant(&mut k, scratch, "/c/missing");
    let rc = complete(
        &mut k,
        SyscallFrame::new(
            Syscall::Open as u32,
            [path, len, OpenMode::READ.bits(), 0],
        ),
    );
    assert_eq!(rc, KernelError::NotFound.code());

    let rc = complete(&mut k, SyscallFrame::new(999, [0; 4]));
    assert_eq!(rc, KernelError::Invalid.code());
}

#[test]
fn print_string_reaches_the_console() {
    let (mut k, _) = machine();
    let scratch = PAGE_SIZE as u32 + 2048;
    let (s, len) = plant(&mut k, scratch, "boot ok\n");
    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::PrintString as u32, [s, len, 0, 0])
        ),
        0
    );
    assert_eq!(k.console.take_output(), b"boot ok\n");
}

#[test]
fn get_key_blocks_until_keys_arrive() {
    let (mut k, pid) = machine();
    let outcome = k.syscall(SyscallFrame::new(Syscall::GetKey as u32, [0; 4]));
    assert_eq!(outcome, SyscallOutcome::Blocked);
    assert!(k.threads.thread(pid).blocked);
    k.dispatch();

    k.push_keys(b"g");
    assert!(!k.threads.thread(pid).blocked);
    assert_eq!(k.dispatch(), pid);
    // the parked trap frame re-issues and completes
    assert_eq!(
        k.retry_pending(),
        Some(SyscallOutcome::Complete(b'g' as i32))
    );
}

#[test]
fn create_pipe_installs_two_fds() {
    let (mut k, _) = machine();
    let scratch = PAGE_SIZE as u32 + 2048;
    let rc = complete(
        &mut k,
        SyscallFrame::new(Syscall::CreatePipe as u32, [scratch, scratch + 4, 0, 0]),
    );
    assert_eq!(rc, 0);

    let ctx = k.threads.thread(k.current()).context.unwrap();
    let mut raw = [0u8; 8];
    assert!(k.vm.copy_from_user(&mut k.ints, ctx, &mut raw, scratch));
    let rd_fd = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let wr_fd = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    assert_ne!(rd_fd, wr_fd);

    // write through one end, read through the other
    let (data, len) = plant(&mut k, scratch + 64, "piped");
    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::Write as u32, [wr_fd, data, len, 0])
        ),
        5
    );
    let back_at = scratch + 128;
    assert_eq!(
        complete(
            &mut k,
            SyscallFrame::new(Syscall::Read as u32, [rd_fd, back_at, 5, 0])
        ),
        5
    );
}

#[test]
fn sbrk_grows_the_heap() {
    let (mut k, _) = machine();
    let old = complete(
        &mut k,
        SyscallFrame::new(Syscall::Sbrk as u32, [PAGE_SIZE as u32, 0, 0, 0]),
    );
    assert!(old > 0);
    let older = old;
    let old = complete(&mut k, SyscallFrame::new(Syscall::Sbrk as u32, [0, 0, 0, 0]));
    assert_eq!(old, older + PAGE_SIZE as i32);
}
