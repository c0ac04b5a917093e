// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Common allocator contract shared by the shared-memory allocator, the
// arena pool and the fixed-region bump pool.  Consumers such as the slab
// cache and the hash table are generic over `MemAllocator`, so each variant
// stays a concrete type and the capability matrix is expressed by the
// default `Unsupported` method bodies.

use thiserror::Error;

use crate::commpool::CommPoolError;
use crate::pool::PoolError;
use crate::shmem::ShmemError;

/// Error surfaced by any `MemAllocator` operation.  Concrete allocator
/// errors pass through; `Unsupported` marks an operation outside the
/// variant's capability set (e.g. `free` on an arena).
#[derive(Debug, Error)]
pub enum AllocError {
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    CommPool(#[from] CommPoolError),
    #[error("{allocator}: {op} not supported")]
    Unsupported {
        allocator: &'static str,
        op: &'static str,
    },
}

/// Allocator statistics, as published by variants that track them.
/// Sizes are bytes; `st_count`/`st_size` count live storage headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStat {
    pub total_size: usize,
    pub system_size: usize,
    pub used_size: usize,
    pub reqs_size: usize,
    pub st_count: usize,
    pub st_size: usize,
    pub failed: usize,
    pub split: usize,
    pub split_failed: usize,
}

/// The uniform allocator contract.
///
/// Variants implement the subset they support; the rest fall through to the
/// `Unsupported` defaults.  All methods take `&self`: allocators hand out
/// raw pointers and interior state lives behind raw region pointers, so
/// serialising concurrent mutators is the caller's job (a process lock for
/// cross-worker shared memory, nothing for per-connection arenas).
pub trait MemAllocator {
    /// Short variant name used in `Unsupported` errors and logs.
    fn name(&self) -> &'static str;

    /// Allocate `size` bytes.
    fn alloc(&self, size: usize) -> Result<*mut u8, AllocError>;

    /// Allocate `size` zeroed bytes.
    fn calloc(&self, size: usize) -> Result<*mut u8, AllocError> {
        let ptr = self.alloc(size)?;
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
        Ok(ptr)
    }

    /// Allocate the largest block available, whole, provided it holds at
    /// least `minsize` bytes.  Returns the pointer and the actual size.
    fn split_alloc(&self, minsize: usize) -> Result<(*mut u8, usize), AllocError> {
        let _ = minsize;
        Err(AllocError::Unsupported {
            allocator: self.name(),
            op: "split_alloc",
        })
    }

    /// Return a block obtained from `alloc`/`calloc`/`split_alloc`.
    fn free(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let _ = ptr;
        Err(AllocError::Unsupported {
            allocator: self.name(),
            op: "free",
        })
    }

    /// Whether this variant supports `split_alloc`.  The slab cache keys its
    /// split path off this instead of probing with a throwaway call.
    fn supports_split_alloc(&self) -> bool {
        false
    }

    /// Whether this variant supports per-allocation `free`.
    fn supports_free(&self) -> bool {
        false
    }

    /// Current statistics, for variants that keep them.
    fn stat(&self) -> Option<AllocStat> {
        None
    }
}
