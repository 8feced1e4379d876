//! End-to-end scheduler scenarios: round-robin fairness and the MLF
//! demotion/promotion lifecycle.

use std::collections::BTreeMap;

use gossamer_kernel::sched::{PRIORITY_NORMAL, SCHEDULE_MLF, SCHEDULE_ROUNDROBIN};
use gossamer_kernel::{Kernel, KernelConfig, KernelError};

fn kernel() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(KernelConfig::default())
}

#[test]
fn rr_shares_ticks_fairly() {
    let mut k = kernel();
    let workers = [
        k.spawn_kernel_thread(PRIORITY_NORMAL),
        k.spawn_kernel_thread(PRIORITY_NORMAL),
        k.spawn_kernel_thread(PRIORITY_NORMAL),
    ];
    k.set_scheduling_policy(SCHEDULE_ROUNDROBIN, 2).unwrap();
    k.dispatch();

    let mut ticks: BTreeMap<u32, u32> = BTreeMap::new();
    for _ in 0..60 {
        *ticks.entry(k.current()).or_default() += 1;
        k.tick();
    }

    for &pid in &workers {
        let got = *ticks.get(&pid).unwrap_or(&0) as i32;
        assert!(
            (got - 20).abs() <= 2,
            "thread {} ran {} of 60 ticks",
            pid,
            got
        );
    }
    assert_eq!(
        ticks.get(&k.idle_thread()),
        None,
        "idle must not run while workers are ready"
    );
}

#[test]
fn mlf_demotes_cpu_hogs_and_promotes_wakers() {
    let mut k = kernel();
    let hog = k.spawn_kernel_thread(PRIORITY_NORMAL);
    k.set_scheduling_policy(SCHEDULE_MLF, 2).unwrap();
    k.dispatch();
    assert_eq!(k.current(), hog);
    assert_eq!(k.threads.thread(hog).current_level, 0);

    // three full quanta without blocking: level 0 -> 3
    k.tick();
    k.tick();
    assert_eq!(k.current(), hog);
    assert_eq!(k.threads.thread(hog).current_level, 1);
    k.tick();
    k.tick();
    assert_eq!(k.current(), hog);
    assert_eq!(k.threads.thread(hog).current_level, 2);
    k.tick();
    k.tick();
    assert_eq!(k.threads.thread(hog).current_level, 3);
    // at the bottom level the hog queues FIFO behind the idle thread
    assert_eq!(k.current(), k.idle_thread());
    k.tick();
    k.tick();
    assert_eq!(k.current(), hog);

    // now block on an empty pipe...
    let (mut rd, mut wr) = k.create_pipe();
    let mut buf = [0u8; 4];
    assert_eq!(k.file_read(&mut rd, &mut buf), Err(KernelError::WouldBlock));
    assert!(k.threads.thread(hog).blocked);
    let idle = k.dispatch();
    assert_eq!(idle, k.idle_thread());

    // ...and get promoted one level on wake-up
    assert_eq!(k.file_write(&mut wr, b"x").unwrap(), 1);
    assert!(!k.threads.thread(hog).blocked);
    assert_eq!(k.threads.thread(hog).current_level, 2);

    k.file_close(rd).unwrap();
    k.file_close(wr).unwrap();
}

#[test]
fn policy_validation_is_surfaced() {
    let mut k = kernel();
    assert_eq!(
        k.set_scheduling_policy(SCHEDULE_MLF, 0),
        Err(KernelError::Invalid)
    );
    assert_eq!(
        k.set_scheduling_policy(99, 4),
        Err(KernelError::Unsupported)
    );
}
