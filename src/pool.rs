// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Arena allocator for per-connection lifetimes: small allocations bump a
// cursor through chained blocks, large ones go on their own list, and the
// whole arena is destroyed at once.  There is no per-allocation free for
// the small path.
//
// Block layout: the first block carries the full `Pool` descriptor; chained
// blocks only use the leading `PoolData` part, the rest of the descriptor
// space is handed out as payload.

use std::ptr;

use thiserror::Error;

use crate::alloc::{AllocError, MemAllocator};

pub const POOL_DEFAULT_SIZE: usize = 2048;

/// Blocks this full get skipped this many times before the search no
/// longer starts at them.
const POOL_MAX_FAILED: usize = 4;

/// Small allocations are capped at a page; anything bigger goes on the
/// large list even if a fresh block could hold it.
const POOL_MAX_SMALL: usize = 4095;

const POOL_ALIGNMENT: usize = 16;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool_create: size too small for the pool header")]
    CreateSize,
    #[error("pool_create: block allocation failed")]
    CreateOom,
    #[error("pool_alloc: allocation failed")]
    AllocFailed,
}

fn align_ptr(p: *mut u8, align: usize) -> *mut u8 {
    ((p as usize + align - 1) & !(align - 1)) as *mut u8
}

/// Per-block bookkeeping, at the head of every block in the chain.
#[repr(C)]
struct PoolData {
    last: *mut u8,
    end: *mut u8,
    next: *mut Pool,
    failed: usize,
}

/// Header of a large allocation entry; the payload is a separate
/// malloc'd region so it can be freed individually.
#[repr(C)]
struct PoolLarge {
    next: *mut PoolLarge,
    alloc: *mut u8,
}

/// The arena.  `current` is where the small-allocation search starts;
/// `max` separates small (bump) from large (own malloc) requests.
#[repr(C)]
pub struct Pool {
    d: PoolData,
    max: usize,
    current: *mut Pool,
    large: *mut PoolLarge,
}

/// Allocate an arena whose blocks are `size` bytes.
pub fn pool_create(size: usize) -> Result<*mut Pool, PoolError> {
    if size < std::mem::size_of::<Pool>() + POOL_ALIGNMENT {
        return Err(PoolError::CreateSize);
    }
    let p = unsafe { libc::malloc(size) } as *mut Pool;
    if p.is_null() {
        return Err(PoolError::CreateOom);
    }
    unsafe {
        (*p).d.last = (p as *mut u8).add(std::mem::size_of::<Pool>());
        (*p).d.end = (p as *mut u8).add(size);
        (*p).d.next = ptr::null_mut();
        (*p).d.failed = 0;

        let avail = size - std::mem::size_of::<Pool>();
        (*p).max = if avail < POOL_MAX_SMALL {
            avail
        } else {
            POOL_MAX_SMALL
        };
        (*p).current = p;
        (*p).large = ptr::null_mut();
    }
    Ok(p)
}

/// Free every large allocation and every block.
///
/// # Safety
/// `pool` must come from `pool_create` and must not be used afterwards.
pub unsafe fn pool_destroy(pool: *mut Pool) {
    let mut l = (*pool).large;
    while !l.is_null() {
        if !(*l).alloc.is_null() {
            libc::free((*l).alloc as *mut libc::c_void);
        }
        l = (*l).next;
    }

    let mut p = pool;
    while !p.is_null() {
        let next = (*p).d.next;
        libc::free(p as *mut libc::c_void);
        p = next;
    }
}

/// Drop the large list and rewind every block, keeping the chain.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn pool_reset(pool: *mut Pool) {
    let mut l = (*pool).large;
    while !l.is_null() {
        if !(*l).alloc.is_null() {
            libc::free((*l).alloc as *mut libc::c_void);
        }
        l = (*l).next;
    }
    (*pool).large = ptr::null_mut();
    (*pool).current = pool;

    let mut p = pool;
    while !p.is_null() {
        let data_size = if p == pool {
            std::mem::size_of::<Pool>()
        } else {
            std::mem::size_of::<PoolData>()
        };
        (*p).d.last = (p as *mut u8).add(data_size);
        (*p).d.failed = 0;
        p = (*p).d.next;
    }
}

unsafe fn pool_alloc_block(pool: *mut Pool, size: usize) -> *mut u8 {
    let psize = (*pool).d.end as usize - pool as usize;
    let block = libc::malloc(psize) as *mut Pool;
    if block.is_null() {
        return ptr::null_mut();
    }

    (*block).d.end = (block as *mut u8).add(psize);
    (*block).d.next = ptr::null_mut();
    (*block).d.failed = 0;

    let mut m = (block as *mut u8).add(std::mem::size_of::<PoolData>());
    m = align_ptr(m, POOL_ALIGNMENT);
    (*block).d.last = m.add(size);

    // Retire blocks that keep failing from the front of the search.
    let mut p = (*pool).current;
    while !(*p).d.next.is_null() {
        (*p).d.failed += 1;
        if (*p).d.failed > POOL_MAX_FAILED {
            (*pool).current = (*p).d.next;
        }
        p = (*p).d.next;
    }
    (*p).d.next = block;

    m
}

unsafe fn pool_alloc_large(pool: *mut Pool, size: usize) -> *mut u8 {
    let data = libc::malloc(size) as *mut u8;
    if data.is_null() {
        return ptr::null_mut();
    }

    // Reuse an emptied large slot before growing the list.
    let mut n = 0;
    let mut l = (*pool).large;
    while !l.is_null() {
        if (*l).alloc.is_null() {
            (*l).alloc = data;
            return data;
        }
        n += 1;
        if n > 3 {
            break;
        }
        l = (*l).next;
    }

    let link = pool_alloc_small(pool, std::mem::size_of::<PoolLarge>()) as *mut PoolLarge;
    if link.is_null() {
        libc::free(data as *mut libc::c_void);
        return ptr::null_mut();
    }
    (*link).alloc = data;
    (*link).next = (*pool).large;
    (*pool).large = link;

    data
}

unsafe fn pool_alloc_small(pool: *mut Pool, size: usize) -> *mut u8 {
    let mut p = (*pool).current;
    loop {
        let m = align_ptr((*p).d.last, POOL_ALIGNMENT);
        if m as usize <= (*p).d.end as usize && (*p).d.end as usize - m as usize >= size {
            (*p).d.last = m.add(size);
            return m;
        }
        p = (*p).d.next;
        if p.is_null() {
            break;
        }
    }
    pool_alloc_block(pool, size)
}

/// Allocate `size` bytes from the arena.  Returns null on exhaustion.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn pool_alloc(pool: *mut Pool, size: usize) -> *mut u8 {
    if size <= (*pool).max {
        pool_alloc_small(pool, size)
    } else {
        pool_alloc_large(pool, size)
    }
}

/// `pool_alloc` + zero fill.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn pool_calloc(pool: *mut Pool, size: usize) -> *mut u8 {
    let p = pool_alloc(pool, size);
    if !p.is_null() {
        ptr::write_bytes(p, 0, size);
    }
    p
}

/// Free one large allocation early.  Returns true when `ptr` was found on
/// the large list.
///
/// # Safety
/// `pool` must come from `pool_create`; `ptr` from `pool_alloc` on it.
pub unsafe fn pool_free_large(pool: *mut Pool, ptr_: *mut u8) -> bool {
    let mut l = (*pool).large;
    while !l.is_null() {
        if (*l).alloc == ptr_ {
            libc::free(ptr_ as *mut libc::c_void);
            (*l).alloc = ptr::null_mut();
            return true;
        }
        l = (*l).next;
    }
    false
}

/// `MemAllocator` facade over an arena: alloc/calloc only, no free and no
/// split_alloc, matching the arena's capability set.
pub struct PoolAllocator {
    pool: *mut Pool,
}

impl PoolAllocator {
    /// # Safety
    /// `pool` must come from `pool_create` and outlive the facade.
    pub unsafe fn new(pool: *mut Pool) -> Self {
        Self { pool }
    }
}

impl MemAllocator for PoolAllocator {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn alloc(&self, size: usize) -> Result<*mut u8, AllocError> {
        let p = unsafe { pool_alloc(self.pool, size) };
        if p.is_null() {
            return Err(AllocError::Pool(PoolError::AllocFailed));
        }
        Ok(p)
    }
}
