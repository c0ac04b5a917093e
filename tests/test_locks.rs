// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock tests: the CAS spin lock under thread contention, and the
// process-shared mutex/rwlock placed in shared-memory allocator memory.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use libsrv::atomic_lock::{atomic_lock_create, AtomicLock};
use libsrv::process_lock::{ProcessLock, ProcessRwlock};
use libsrv::shmem::{Shmem, ShmemLevel};

fn shmem() -> Shmem {
    Shmem::create(1 << 20, 64, 4096, ShmemLevel::Exp, 2).expect("create shmem")
}

#[test]
fn atomic_basic_cycle() {
    let lock = AtomicLock::new();
    assert!(lock.try_on());
    assert!(!lock.try_on());
    lock.off();
    assert!(lock.try_on());
    lock.off_force();
    lock.on();
    lock.off();
}

#[test]
fn atomic_off_when_already_off_is_noop() {
    let lock = AtomicLock::new();
    lock.off();
    assert!(lock.try_on());
    lock.off();
}

#[test]
fn atomic_critical_section() {
    let lock = Arc::new(AtomicLock::new());
    let counter = Arc::new(AtomicI32::new(0));
    let iterations = 1000;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..iterations {
                    lock.on();
                    let v = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.off();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), iterations * 4);
}

#[test]
fn atomic_lock_in_shared_memory() {
    let shm = shmem();
    let lock = atomic_lock_create(&shm).expect("place lock");
    unsafe {
        assert!((*lock).try_on());
        (*lock).off();
    }
    shm.free(lock as *mut u8).expect("free");
    shm.release().expect("release");
}

#[test]
fn process_lock_cycle() {
    let shm = shmem();
    let lock = ProcessLock::create(&shm).expect("create lock");

    lock.on().expect("on");
    lock.off().expect("off");

    assert!(lock.try_on().expect("try_on"));
    lock.off().expect("off");

    lock.reset().expect("reset");
    lock.on().expect("on after reset");
    lock.off().expect("off");

    lock.release(&shm).expect("release lock");
    shm.release().expect("release");
}

#[test]
fn process_lock_mutual_exclusion() {
    let shm = shmem();
    let lock = Arc::new(ProcessLock::create(&shm).expect("create lock"));
    let counter = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.on().expect("on");
                    let v = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.off().expect("off");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 800);

    Arc::try_unwrap(lock)
        .ok()
        .expect("sole owner")
        .release(&shm)
        .expect("release lock");
    shm.release().expect("release");
}

#[test]
fn process_try_on_reports_busy() {
    let shm = shmem();
    let lock = Arc::new(ProcessLock::create(&shm).expect("create lock"));

    lock.on().expect("on");
    let peer = Arc::clone(&lock);
    let busy = thread::spawn(move || peer.try_on().expect("try_on"))
        .join()
        .unwrap();
    assert!(!busy);
    lock.off().expect("off");

    Arc::try_unwrap(lock)
        .ok()
        .expect("sole owner")
        .release(&shm)
        .expect("release lock");
    shm.release().expect("release");
}

#[test]
fn rwlock_shared_readers_exclusive_writer() {
    let shm = shmem();
    let rw = Arc::new(ProcessRwlock::create(&shm).expect("create rwlock"));

    // Two read locks may be held at once from the same thread.
    rw.read_on().expect("read 1");
    rw.read_on().expect("read 2");
    rw.off().expect("off 1");
    rw.off().expect("off 2");

    // With a writer inside, a try-write from another thread fails.
    rw.write_on().expect("write");
    let peer = Arc::clone(&rw);
    let ok = thread::spawn(move || peer.write_try_on().expect("try write"))
        .join()
        .unwrap();
    assert!(!ok);
    rw.off().expect("off");

    rw.reset().expect("reset");

    Arc::try_unwrap(rw)
        .ok()
        .expect("sole owner")
        .release(&shm)
        .expect("release rwlock");
    shm.release().expect("release");
}
