// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-shared pthread mutex and rwlock.  The pthread object is placed
// in allocator memory — shared memory in practice, so every worker maps
// the same lock — and carries a signal-mask pair: while the lock is held,
// everything except a small allowed set is blocked, so a signal handler
// cannot preempt the holder and invert priorities across processes.

use std::io;
use std::mem;

use thiserror::Error;

use crate::alloc::{AllocError, MemAllocator};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock: parameter error")]
    Param,
    #[error("lock: allocator error")]
    Allocator(#[source] AllocError),
    #[error("lock: mutex attribute init failed")]
    MutexAttrInit(#[source] io::Error),
    #[error("lock: mutex attribute setpshared failed")]
    MutexAttrSetPshared(#[source] io::Error),
    #[error("lock: mutex init failed")]
    MutexInit(#[source] io::Error),
    #[error("lock: mutex attribute destroy failed")]
    MutexAttrDestroy(#[source] io::Error),
    #[error("lock: mutex destroy failed")]
    MutexDestroy(#[source] io::Error),
    #[error("lock: mutex lock failed")]
    MutexLock(#[source] io::Error),
    #[error("lock: mutex unlock failed")]
    MutexUnlock(#[source] io::Error),
    #[error("lock: sigprocmask failed")]
    Sigprocmask(#[source] io::Error),
    #[error("lock: rwlock attribute init failed")]
    RwlockAttrInit(#[source] io::Error),
    #[error("lock: rwlock attribute setpshared failed")]
    RwlockAttrSetPshared(#[source] io::Error),
    #[error("lock: rwlock init failed")]
    RwlockInit(#[source] io::Error),
    #[error("lock: rwlock attribute destroy failed")]
    RwlockAttrDestroy(#[source] io::Error),
    #[error("lock: rwlock destroy failed")]
    RwlockDestroy(#[source] io::Error),
    #[error("lock: rwlock read lock failed")]
    RwlockRdlock(#[source] io::Error),
    #[error("lock: rwlock unlock failed")]
    RwlockUnlock(#[source] io::Error),
    #[error("lock: rwlock write lock failed")]
    RwlockWrlock(#[source] io::Error),
    #[error("lock: rwlock write try lock failed")]
    RwlockTryWrlock(#[source] io::Error),
}

fn os_err(eno: libc::c_int) -> io::Error {
    io::Error::from_raw_os_error(eno)
}

/// Signals left deliverable while a process lock is held.
const ALLOWED_SIGNALS: [libc::c_int; 10] = [
    libc::SIGALRM,
    libc::SIGINT,
    libc::SIGCHLD,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGIO,
    libc::SIGUSR1,
];

unsafe fn build_block_mask(mask: *mut libc::sigset_t) {
    libc::sigfillset(mask);
    for sig in ALLOWED_SIGNALS {
        libc::sigdelset(mask, sig);
    }
}

unsafe fn block_signals(
    block: *const libc::sigset_t,
    prev: *mut libc::sigset_t,
) -> Result<(), LockError> {
    if libc::sigprocmask(libc::SIG_BLOCK, block, prev) != 0 {
        return Err(LockError::Sigprocmask(io::Error::last_os_error()));
    }
    Ok(())
}

unsafe fn restore_signals(prev: *const libc::sigset_t) -> Result<(), LockError> {
    if libc::sigprocmask(libc::SIG_SETMASK, prev, std::ptr::null_mut()) != 0 {
        return Err(LockError::Sigprocmask(io::Error::last_os_error()));
    }
    Ok(())
}

/// In-memory layout of a process-shared mutex.
#[repr(C)]
struct ProcessLockInner {
    lock: libc::pthread_mutex_t,
    attr: libc::pthread_mutexattr_t,
    sig_block_mask: libc::sigset_t,
    sig_prev_mask: libc::sigset_t,
}

/// Handle to a process-shared mutex living in allocator memory.
pub struct ProcessLock {
    inner: *mut ProcessLockInner,
}

unsafe impl Send for ProcessLock {}
unsafe impl Sync for ProcessLock {}

impl ProcessLock {
    /// Place and initialise the mutex with `PTHREAD_PROCESS_SHARED`.
    pub fn create<A: MemAllocator>(allocator: &A) -> Result<Self, LockError> {
        let inner = allocator
            .alloc(mem::size_of::<ProcessLockInner>())
            .map_err(LockError::Allocator)? as *mut ProcessLockInner;
        unsafe {
            let mut eno = libc::pthread_mutexattr_init(&mut (*inner).attr);
            if eno != 0 {
                return Err(LockError::MutexAttrInit(os_err(eno)));
            }
            eno = libc::pthread_mutexattr_setpshared(
                &mut (*inner).attr,
                libc::PTHREAD_PROCESS_SHARED,
            );
            if eno != 0 {
                return Err(LockError::MutexAttrSetPshared(os_err(eno)));
            }
            eno = libc::pthread_mutex_init(&mut (*inner).lock, &(*inner).attr);
            if eno != 0 {
                return Err(LockError::MutexInit(os_err(eno)));
            }
            build_block_mask(&mut (*inner).sig_block_mask);
        }
        Ok(Self { inner })
    }

    /// Block signals, then take the mutex.
    pub fn on(&self) -> Result<(), LockError> {
        unsafe {
            block_signals(&(*self.inner).sig_block_mask, &mut (*self.inner).sig_prev_mask)?;
            let eno = libc::pthread_mutex_lock(&mut (*self.inner).lock);
            if eno != 0 {
                return Err(LockError::MutexLock(os_err(eno)));
            }
        }
        Ok(())
    }

    /// Non-blocking variant; on `EBUSY` the signal mask is restored and
    /// `Ok(false)` returned.
    pub fn try_on(&self) -> Result<bool, LockError> {
        unsafe {
            block_signals(&(*self.inner).sig_block_mask, &mut (*self.inner).sig_prev_mask)?;
            let eno = libc::pthread_mutex_trylock(&mut (*self.inner).lock);
            if eno == 0 {
                return Ok(true);
            }
            restore_signals(&(*self.inner).sig_prev_mask)?;
            if eno == libc::EBUSY {
                return Ok(false);
            }
            Err(LockError::MutexLock(os_err(eno)))
        }
    }

    /// Drop the mutex and restore the pre-lock signal mask.
    pub fn off(&self) -> Result<(), LockError> {
        unsafe {
            let eno = libc::pthread_mutex_unlock(&mut (*self.inner).lock);
            if eno != 0 {
                return Err(LockError::MutexUnlock(os_err(eno)));
            }
            restore_signals(&(*self.inner).sig_prev_mask)?;
        }
        Ok(())
    }

    /// Re-initialise the mutex in place, for recovery after a holder died.
    pub fn reset(&self) -> Result<(), LockError> {
        unsafe {
            let eno = libc::pthread_mutex_init(&mut (*self.inner).lock, &(*self.inner).attr);
            if eno != 0 {
                return Err(LockError::MutexInit(os_err(eno)));
            }
        }
        Ok(())
    }

    /// Destroy the mutex and return its memory to the allocator.
    pub fn release<A: MemAllocator>(self, allocator: &A) -> Result<(), LockError> {
        unsafe {
            let mut eno = libc::pthread_mutexattr_destroy(&mut (*self.inner).attr);
            if eno != 0 {
                return Err(LockError::MutexAttrDestroy(os_err(eno)));
            }
            eno = libc::pthread_mutex_destroy(&mut (*self.inner).lock);
            if eno != 0 {
                return Err(LockError::MutexDestroy(os_err(eno)));
            }
        }
        allocator
            .free(self.inner as *mut u8)
            .map_err(LockError::Allocator)
    }
}

/// In-memory layout of a process-shared rwlock.
#[repr(C)]
struct ProcessRwlockInner {
    rwlock: libc::pthread_rwlock_t,
    attr: libc::pthread_rwlockattr_t,
    sig_block_mask: libc::sigset_t,
    sig_prev_mask: libc::sigset_t,
}

/// Handle to a process-shared rwlock living in allocator memory.
pub struct ProcessRwlock {
    inner: *mut ProcessRwlockInner,
}

unsafe impl Send for ProcessRwlock {}
unsafe impl Sync for ProcessRwlock {}

impl ProcessRwlock {
    /// Place and initialise the rwlock with `PTHREAD_PROCESS_SHARED`.
    pub fn create<A: MemAllocator>(allocator: &A) -> Result<Self, LockError> {
        let inner = allocator
            .alloc(mem::size_of::<ProcessRwlockInner>())
            .map_err(LockError::Allocator)? as *mut ProcessRwlockInner;
        unsafe {
            let mut eno = libc::pthread_rwlockattr_init(&mut (*inner).attr);
            if eno != 0 {
                return Err(LockError::RwlockAttrInit(os_err(eno)));
            }
            eno = libc::pthread_rwlockattr_setpshared(
                &mut (*inner).attr,
                libc::PTHREAD_PROCESS_SHARED,
            );
            if eno != 0 {
                return Err(LockError::RwlockAttrSetPshared(os_err(eno)));
            }
            eno = libc::pthread_rwlock_init(&mut (*inner).rwlock, &(*inner).attr);
            if eno != 0 {
                return Err(LockError::RwlockInit(os_err(eno)));
            }
            build_block_mask(&mut (*inner).sig_block_mask);
        }
        Ok(Self { inner })
    }

    /// Block signals, then take the read side.
    pub fn read_on(&self) -> Result<(), LockError> {
        unsafe {
            block_signals(&(*self.inner).sig_block_mask, &mut (*self.inner).sig_prev_mask)?;
            let eno = libc::pthread_rwlock_rdlock(&mut (*self.inner).rwlock);
            if eno != 0 {
                return Err(LockError::RwlockRdlock(os_err(eno)));
            }
        }
        Ok(())
    }

    /// Block signals, then take the write side.
    pub fn write_on(&self) -> Result<(), LockError> {
        unsafe {
            block_signals(&(*self.inner).sig_block_mask, &mut (*self.inner).sig_prev_mask)?;
            let eno = libc::pthread_rwlock_wrlock(&mut (*self.inner).rwlock);
            if eno != 0 {
                return Err(LockError::RwlockWrlock(os_err(eno)));
            }
        }
        Ok(())
    }

    /// Non-blocking write attempt; restores the mask on `EBUSY`.
    pub fn write_try_on(&self) -> Result<bool, LockError> {
        unsafe {
            block_signals(&(*self.inner).sig_block_mask, &mut (*self.inner).sig_prev_mask)?;
            let eno = libc::pthread_rwlock_trywrlock(&mut (*self.inner).rwlock);
            if eno == 0 {
                return Ok(true);
            }
            restore_signals(&(*self.inner).sig_prev_mask)?;
            if eno == libc::EBUSY {
                return Ok(false);
            }
            Err(LockError::RwlockTryWrlock(os_err(eno)))
        }
    }

    /// Drop whichever side is held and restore the signal mask.
    pub fn off(&self) -> Result<(), LockError> {
        unsafe {
            let eno = libc::pthread_rwlock_unlock(&mut (*self.inner).rwlock);
            if eno != 0 {
                return Err(LockError::RwlockUnlock(os_err(eno)));
            }
            restore_signals(&(*self.inner).sig_prev_mask)?;
        }
        Ok(())
    }

    /// Re-initialise the rwlock in place.
    pub fn reset(&self) -> Result<(), LockError> {
        unsafe {
            let eno = libc::pthread_rwlock_init(&mut (*self.inner).rwlock, &(*self.inner).attr);
            if eno != 0 {
                return Err(LockError::RwlockInit(os_err(eno)));
            }
        }
        Ok(())
    }

    /// Destroy the rwlock and return its memory to the allocator.
    pub fn release<A: MemAllocator>(self, allocator: &A) -> Result<(), LockError> {
        unsafe {
            let mut eno = libc::pthread_rwlockattr_destroy(&mut (*self.inner).attr);
            if eno != 0 {
                return Err(LockError::RwlockAttrDestroy(os_err(eno)));
            }
            eno = libc::pthread_rwlock_destroy(&mut (*self.inner).rwlock);
            if eno != 0 {
                return Err(LockError::RwlockDestroy(os_err(eno)));
            }
        }
        allocator
            .free(self.inner as *mut u8)
            .map_err(LockError::Allocator)
    }
}
