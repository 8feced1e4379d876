//! GOSFS end to end: the double-indirect boundary, write/read laws,
//! and sync-gated persistence, driven through the kernel surface.

use gossamer_kernel::fs::file::OpenMode;
use gossamer_kernel::fs::gosfs::{
    Gosfs, GOSFS_FS_BLOCK_SIZE, GOSFS_NUM_DIRECT_BLOCKS, GOSFS_PTRS_PER_BLOCK,
};
use gossamer_kernel::{Kernel, KernelConfig, KernelError};

fn kernel_with_volume() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut k = Kernel::new(KernelConfig::default());
    // 16 MiB volume: room for the superblock plus a double-indirect file
    k.vfs.devices.register("ide0", 32768).unwrap();
    k.format("ide0", "gosfs").unwrap();
    k.mount("ide0", "c", "gosfs").unwrap();
    k
}

#[test]
fn format_mount_stat_root() {
    let mut k = kernel_with_volume();
    let stat = k.stat("/c/").unwrap();
    assert!(stat.is_directory);
    assert!(stat.size >= 2);
}

#[test]
fn write_close_read_back_law() {
    let mut k = kernel_with_volume();
    let payload = b"what is written shall be read";

    let mut f = k
        .open("/c/law.txt", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    assert_eq!(k.file_write(&mut f, payload).unwrap(), payload.len());
    k.file_close(f).unwrap();

    let mut f = k.open("/c/law.txt", OpenMode::READ).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(k.file_read(&mut f, &mut back).unwrap(), payload.len());
    assert_eq!(&back, payload);
    // past the end: zero bytes
    let mut tail = [0u8; 8];
    assert_eq!(k.file_read(&mut f, &mut tail).unwrap(), 0);
    k.file_close(f).unwrap();
}

#[test]
fn double_indirect_file_round_trip() {
    let mut k = kernel_with_volume();
    let bs = GOSFS_FS_BLOCK_SIZE as u64;
    // three blocks past the single-indirect capacity
    let blocks = (GOSFS_NUM_DIRECT_BLOCKS + GOSFS_PTRS_PER_BLOCK + 3) as u64;

    let mut f = k
        .open("/c/big", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    for lblock in 0..blocks {
        k.file_seek(&mut f, lblock * bs).unwrap();
        let byte = [(lblock % 251) as u8];
        assert_eq!(
            k.file_write(&mut f, &byte).unwrap(),
            1,
            "write at block {}",
            lblock
        );
    }
    let stat = k.file_stat(&f).unwrap();
    assert_eq!(stat.size, (blocks - 1) * bs + 1);

    // seek back and verify every marker
    for lblock in 0..blocks {
        k.file_seek(&mut f, lblock * bs).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(k.file_read(&mut f, &mut byte).unwrap(), 1);
        assert_eq!(byte[0], (lblock % 251) as u8, "block {} marker", lblock);
    }
    k.file_close(f).unwrap();
}

#[test]
fn double_indirect_accounting_via_free_list() {
    let _ = env_logger::builder().is_test(true).try_init();
    // drive the instance directly for block-accounting visibility
    let mut k = Kernel::new(KernelConfig::default());
    let dev = k.vfs.devices.register("ide0", 32768).unwrap();
    k.format("ide0", "gosfs").unwrap();

    let mut exec = gossamer_kernel::sched::Exec {
        ints: &mut k.ints,
        sched: &mut k.sched,
        threads: &mut k.threads,
        current: 1,
        now: 0,
    };
    let fs = Gosfs::mount(&dev, 32, &mut exec).unwrap();
    let fs = std::sync::Arc::new(fs);

    let free_before = fs.free_blocks();
    let blocks = (GOSFS_NUM_DIRECT_BLOCKS + GOSFS_PTRS_PER_BLOCK + 3) as u64;
    let bs = GOSFS_FS_BLOCK_SIZE as u64;

    let f = Gosfs::open_file(&fs, "/big", OpenMode::WRITE | OpenMode::CREATE, 0, &mut exec).unwrap();
    drop(f);
    let stat_before = fs.stat("/big", &mut exec).unwrap();
    assert_eq!(stat_before.size, 0);

    // the open handle records the inode it resolved to
    let inode = match Gosfs::open_file(&fs, "/big", OpenMode::WRITE, 0, &mut exec)
        .unwrap()
        .body
    {
        gossamer_kernel::fs::file::FileBody::Gos(entry) => entry.inode,
        _ => unreachable!("gosfs open must yield a gosfs body"),
    };

    for lblock in 0..blocks {
        fs.file_write(inode, lblock * bs, OpenMode::WRITE, b"z", &mut exec)
            .unwrap();
    }
    assert_eq!(fs.blocks_used(inode), blocks, "data blocks recorded");
    // data blocks + the single-indirect block + the double-indirect
    // top and its first pointer block
    assert_eq!(fs.free_blocks(), free_before - blocks - 3);
}

#[test]
fn create_then_delete_directory_is_a_noop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut k = Kernel::new(KernelConfig::default());
    let dev = k.vfs.devices.register("ide0", 8192).unwrap();
    k.format("ide0", "gosfs").unwrap();

    let mut exec = gossamer_kernel::sched::Exec {
        ints: &mut k.ints,
        sched: &mut k.sched,
        threads: &mut k.threads,
        current: 1,
        now: 0,
    };
    let fs = Gosfs::mount(&dev, 32, &mut exec).unwrap();
    let fs = std::sync::Arc::new(fs);

    let free_before = fs.free_blocks();
    let root_size = fs.stat("/", &mut exec).unwrap().size;

    fs.create_directory("/scratch", 0, &mut exec).unwrap();
    assert!(fs.stat("/scratch", &mut exec).unwrap().is_directory);
    fs.delete("/scratch", &mut exec).unwrap();

    assert_eq!(fs.free_blocks(), free_before, "same free state");
    assert_eq!(fs.stat("/", &mut exec).unwrap().size, root_size);
    assert_eq!(
        fs.stat("/scratch", &mut exec).unwrap_err(),
        KernelError::NotFound
    );
}

#[test]
fn persistence_requires_sync() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut k = Kernel::new(KernelConfig::default());
    k.vfs.devices.register("ide0", 8192).unwrap();
    k.format("ide0", "gosfs").unwrap();
    k.mount("ide0", "c", "gosfs").unwrap();

    let mut f = k
        .open("/c/durable", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    k.file_write(&mut f, b"bytes").unwrap();
    k.file_close(f).unwrap();
    k.sync().unwrap();

    // a second mount of the same device sees the synced state
    k.mount("ide0", "d", "gosfs").unwrap();
    let stat = k.stat("/d/durable").unwrap();
    assert_eq!(stat.size, 5);
}

#[test]
fn acl_enforcement_through_the_vfs() {
    let mut k = kernel_with_volume();
    let mut f = k
        .open("/c/secret", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    k.file_write(&mut f, b"top").unwrap();
    k.file_close(f).unwrap();

    // owner is uid 0 here; grant uid 7 read-only
    k.set_acl("/c/secret", 7, OpenMode::READ.bits()).unwrap();

    // spawn a process, drop to uid 7, and try the syscalls' view
    let mut init = k
        .open("/c/init", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    k.file_write(&mut init, &[1u8; 16]).unwrap();
    k.file_close(init).unwrap();
    let pid = k.spawn("/c/init", "init").unwrap();
    assert_eq!(k.dispatch(), pid);
    k.set_effective_uid(7).unwrap();

    assert!(k.open("/c/secret", OpenMode::READ).is_ok());
    assert_eq!(
        k.open("/c/secret", OpenMode::WRITE).unwrap_err(),
        KernelError::Access
    );
    assert_eq!(
        k.delete("/c/secret").unwrap_err(),
        KernelError::Access,
        "delete needs write permission"
    );
}
