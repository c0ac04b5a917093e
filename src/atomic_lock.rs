// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// 64-bit CAS spin lock.  The word lives wherever the caller places it —
// a static, an arena, or shared memory — so the same lock type guards the
// process-wide connection reservoir and in-region structures alike.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::MemAllocator;
use crate::process_lock::LockError;
use crate::pool::{pool_alloc, Pool};

pub const LOCK_OFF: u64 = 1;
pub const LOCK_ON: u64 = 2;

/// Adaptive backoff: busy spin, then pause hint, then yield, then sleep.
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A spin lock toggling one 64-bit word between `LOCK_OFF` and `LOCK_ON`.
#[repr(C)]
pub struct AtomicLock {
    lock: AtomicU64,
}

impl AtomicLock {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU64::new(LOCK_OFF),
        }
    }

    /// Re-arm the word to OFF regardless of its current value.
    pub fn reset(&self) {
        self.lock.store(LOCK_OFF, Ordering::Release);
    }

    /// One CAS attempt; true when the lock was taken.
    pub fn try_on(&self) -> bool {
        self.lock
            .compare_exchange(LOCK_OFF, LOCK_ON, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Busy-wait until the lock is taken.
    pub fn on(&self) {
        let mut k = 0u32;
        while self
            .lock
            .compare_exchange_weak(LOCK_OFF, LOCK_ON, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
    }

    /// Release the lock.  A lock that is already OFF stays OFF.
    pub fn off(&self) {
        if self.lock.load(Ordering::Acquire) == LOCK_OFF {
            return;
        }
        let mut k = 0u32;
        while self
            .lock
            .compare_exchange_weak(LOCK_ON, LOCK_OFF, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
    }

    /// Stomp the word to OFF without a CAS, for crash recovery paths.
    pub fn off_force(&self) {
        self.lock.store(LOCK_OFF, Ordering::Release);
    }
}

impl Default for AtomicLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for AtomicLock {}
unsafe impl Sync for AtomicLock {}

/// Place a new lock in allocator memory (shared memory when the allocator
/// is the shmem variant, so sibling workers see the same word).
pub fn atomic_lock_create<A: MemAllocator>(allocator: &A) -> Result<*mut AtomicLock, LockError> {
    let ptr = allocator
        .alloc(std::mem::size_of::<AtomicLock>())
        .map_err(LockError::Allocator)? as *mut AtomicLock;
    unsafe { (*ptr).lock = AtomicU64::new(LOCK_OFF) };
    Ok(ptr)
}

/// Place a new lock in an arena.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn atomic_lock_pool_create(pool: *mut Pool) -> *mut AtomicLock {
    let ptr = pool_alloc(pool, std::mem::size_of::<AtomicLock>()) as *mut AtomicLock;
    if !ptr.is_null() {
        (*ptr).lock = AtomicU64::new(LOCK_OFF);
    }
    ptr
}
