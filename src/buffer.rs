// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The buffer descriptor consumed by chain I/O.  A buffer views either a
// memory region (`start..end` with `pos`/`last` cursors) or a file region
// (`file_pos..file_last` on a descriptor supplied by the output context);
// the two kinds are mutually exclusive.

use crate::pool::{pool_alloc, Pool};

/// Buffer descriptor.  `pos..last` is unread payload for memory buffers;
/// `file_pos..file_last` the unsent span for file buffers.
#[repr(C)]
pub struct Buf {
    pub start: *mut u8,
    pub pos: *mut u8,
    pub last: *mut u8,
    pub end: *mut u8,
    pub file_pos: i64,
    pub file_last: i64,
    /// Pool-owned payloads are reclaimed with their pool; heap payloads
    /// are freed through `buffer_free`.
    pub temporary: bool,
    pub memory: bool,
    pub in_file: bool,
}

/// Unconsumed bytes of `buf`, whichever kind it is.
///
/// # Safety
/// `buf` must be a valid buffer descriptor.
pub unsafe fn buffer_size(buf: *const Buf) -> usize {
    if (*buf).memory {
        (*buf).last as usize - (*buf).pos as usize
    } else {
        ((*buf).file_last - (*buf).file_pos) as usize
    }
}

/// Rewind the cursors to the start of the region.
///
/// # Safety
/// `buf` must be a valid memory buffer descriptor.
pub unsafe fn buffer_reset(buf: *mut Buf) {
    (*buf).pos = (*buf).start;
    (*buf).last = (*buf).start;
}

/// Allocate a bare descriptor from the pool.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn buffer_alloc(pool: *mut Pool) -> *mut Buf {
    pool_alloc(pool, std::mem::size_of::<Buf>()) as *mut Buf
}

/// Allocate a descriptor plus a `size`-byte memory region.  With a null
/// pool both come from the heap and are released via `buffer_free`.
///
/// # Safety
/// `pool`, when non-null, must come from `pool_create`.
pub unsafe fn buffer_create(pool: *mut Pool, size: usize) -> *mut Buf {
    if size == 0 {
        return std::ptr::null_mut();
    }

    let b: *mut Buf;
    if pool.is_null() {
        b = libc::malloc(std::mem::size_of::<Buf>()) as *mut Buf;
        if b.is_null() {
            return std::ptr::null_mut();
        }
        (*b).start = libc::malloc(size) as *mut u8;
        if (*b).start.is_null() {
            libc::free(b as *mut libc::c_void);
            return std::ptr::null_mut();
        }
        (*b).temporary = false;
    } else {
        b = buffer_alloc(pool);
        if b.is_null() {
            return std::ptr::null_mut();
        }
        (*b).start = pool_alloc(pool, size);
        if (*b).start.is_null() {
            return std::ptr::null_mut();
        }
        (*b).temporary = true;
    }

    (*b).pos = (*b).start;
    (*b).last = (*b).start;
    (*b).end = (*b).start.add(size);
    (*b).file_pos = 0;
    (*b).file_last = 0;
    (*b).memory = true;
    (*b).in_file = false;

    b
}

/// Describe the span `file_pos..file_last` of a file; the descriptor
/// itself comes from the pool.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn buffer_create_file(pool: *mut Pool, file_pos: i64, file_last: i64) -> *mut Buf {
    let b = buffer_alloc(pool);
    if b.is_null() {
        return std::ptr::null_mut();
    }
    (*b).start = std::ptr::null_mut();
    (*b).pos = std::ptr::null_mut();
    (*b).last = std::ptr::null_mut();
    (*b).end = std::ptr::null_mut();
    (*b).file_pos = file_pos;
    (*b).file_last = file_last;
    (*b).temporary = true;
    (*b).memory = false;
    (*b).in_file = true;
    b
}

/// Move unread payload to the front of the region so the tail is free
/// for the next read.
///
/// # Safety
/// `buf` must be a valid memory buffer descriptor.
pub unsafe fn buffer_shrink(buf: *mut Buf) {
    if buf.is_null() || (*buf).start == (*buf).pos {
        return;
    }
    let blen = buffer_size(buf);
    if blen == 0 {
        buffer_reset(buf);
        return;
    }
    std::ptr::copy((*buf).pos, (*buf).start, blen);
    (*buf).pos = (*buf).start;
    (*buf).last = (*buf).pos.add(blen);
}

/// Free a heap-backed buffer.  Pool-backed buffers go away with the pool.
///
/// # Safety
/// `buf` must come from `buffer_create` with a null pool.
pub unsafe fn buffer_free(buf: *mut Buf) {
    if buf.is_null() || (*buf).temporary {
        return;
    }
    libc::free((*buf).start as *mut libc::c_void);
    libc::free(buf as *mut libc::c_void);
}
