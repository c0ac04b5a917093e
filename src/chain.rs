// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Buffer chains: singly linked lists of buffer references, the unit that
// vectored output consumes.  `chain_output` drives a chain through the
// connection's send functions, alternating between the memory path
// (writev) and the file path (sendfile) as the buffer kinds change.

use crate::buffer::{buffer_size, Buf};
use crate::conn::Conn;
use crate::pool::{pool_alloc, Pool};
use crate::sysio::ChainError;

/// One chain node referencing a buffer.
#[repr(C)]
pub struct Chain {
    pub buf: *mut Buf,
    pub next: *mut Chain,
}

/// Outcome of an output pass over a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Everything was sent.
    Done,
    /// Readiness was lost or the limit was hit; call again later.
    Again,
}

/// Allocate a node from the pool.
///
/// # Safety
/// `pool` must come from `pool_create`.
pub unsafe fn chain_alloc(pool: *mut Pool) -> *mut Chain {
    let cl = pool_alloc(pool, std::mem::size_of::<Chain>()) as *mut Chain;
    if cl.is_null() {
        return std::ptr::null_mut();
    }
    (*cl).buf = std::ptr::null_mut();
    (*cl).next = std::ptr::null_mut();
    cl
}

/// Rewind every buffer on the chain.
///
/// # Safety
/// Chain and buffers must be valid.
pub unsafe fn chain_reset(mut cl: *mut Chain) {
    while !cl.is_null() {
        (*(*cl).buf).pos = (*(*cl).buf).start;
        (*(*cl).buf).last = (*(*cl).buf).start;
        cl = (*cl).next;
    }
}

/// Whether no buffer on the chain has unconsumed bytes.
///
/// # Safety
/// Chain and buffers must be valid.
pub unsafe fn chain_empty(mut cl: *const Chain) -> bool {
    while !cl.is_null() {
        if buffer_size((*cl).buf) > 0 {
            return false;
        }
        cl = (*cl).next;
    }
    true
}

/// Total unconsumed bytes over the chain.
///
/// # Safety
/// Chain and buffers must be valid.
pub unsafe fn chain_size(mut cl: *const Chain) -> u64 {
    let mut len = 0u64;
    while !cl.is_null() {
        len += buffer_size((*cl).buf) as u64;
        cl = (*cl).next;
    }
    len
}

/// Append the whole chain `src` to `*dst`.
///
/// # Safety
/// Both chains must be valid; `src` must not already be on `*dst`.
pub unsafe fn chain_append_all(dst: *mut *mut Chain, src: *mut Chain) {
    if dst.is_null() || src.is_null() {
        return;
    }
    let mut dst = dst;
    while !(*dst).is_null() {
        dst = &mut (**dst).next;
    }
    *dst = src;
}

/// Move nodes covering `size` bytes from `src` onto `*dst`; whatever is
/// left of `src` goes to `*free_chain`.
///
/// # Safety
/// All chains must be valid and disjoint.
pub unsafe fn chain_append_with_size(
    dst: *mut *mut Chain,
    mut src: *mut Chain,
    mut size: usize,
    free_chain: *mut *mut Chain,
) {
    if dst.is_null() || src.is_null() || size == 0 {
        return;
    }
    let mut dst = dst;
    while !(*dst).is_null() {
        dst = &mut (**dst).next;
    }
    while !src.is_null() && size > 0 {
        let buf_size = buffer_size((*src).buf);
        *dst = src;
        src = (*src).next;
        (**dst).next = std::ptr::null_mut();
        dst = &mut (**dst).next;
        size = size.saturating_sub(buf_size);
    }
    if !src.is_null() {
        *free_chain = src;
    }
}

/// Append one buffer to `*dst` on a fresh node.  Returns false on pool
/// exhaustion.
///
/// # Safety
/// `pool` must come from `pool_create`; the chain must be valid.
pub unsafe fn chain_append_buffer(pool: *mut Pool, dst: *mut *mut Chain, buf: *mut Buf) -> bool {
    if pool.is_null() || dst.is_null() || buf.is_null() {
        return true;
    }
    let mut dst = dst;
    while !(*dst).is_null() {
        dst = &mut (**dst).next;
    }
    let ln = chain_alloc(pool);
    if ln.is_null() {
        return false;
    }
    (*ln).buf = buf;
    *dst = ln;
    true
}

/// Advance `last` cursors over `size` freshly-read bytes.
///
/// # Safety
/// Chain and buffers must be valid memory buffers.
pub unsafe fn chain_read_update(mut chain: *mut Chain, mut size: usize) {
    while !chain.is_null() && size > 0 {
        let room = (*(*chain).buf).end as usize - (*(*chain).buf).last as usize;
        if size >= room {
            (*(*chain).buf).last = (*(*chain).buf).end;
            size -= room;
        } else {
            (*(*chain).buf).last = (*(*chain).buf).last.add(size);
            size = 0;
        }
        chain = (*chain).next;
    }
}

/// Advance consumption cursors over `size` sent bytes and return the
/// first node with anything left (null when the chain is exhausted).
/// Partially-consumed buffers keep their tail.
///
/// # Safety
/// Chain and buffers must be valid.
pub unsafe fn chain_write_update(mut chain: *mut Chain, mut size: usize) -> *mut Chain {
    while !chain.is_null() && size > 0 {
        let bsize = buffer_size((*chain).buf);
        if size < bsize {
            if (*(*chain).buf).memory {
                (*(*chain).buf).pos = (*(*chain).buf).pos.add(size);
            } else {
                (*(*chain).buf).file_pos += size as i64;
            }
            return chain;
        }
        size -= bsize;
        if (*(*chain).buf).memory {
            (*(*chain).buf).pos = (*(*chain).buf).last;
        } else {
            (*(*chain).buf).file_pos = (*(*chain).buf).file_last;
        }
        chain = (*chain).next;
    }
    chain
}

/// Pending output state for one connection.
pub struct ChainOutputCtx {
    pub out: *mut Chain,
    pub connection: *mut Conn,
    /// Source descriptor for file buffers.
    pub fd: libc::c_int,
    pub limit: usize,
}

/// Queue `in_` (if any) and push as much of the pending chain as the
/// socket accepts, switching between the memory and file send paths per
/// buffer kind.
///
/// # Safety
/// The context's connection, chains and buffers must be valid.
pub unsafe fn chain_output(ctx: &mut ChainOutputCtx, in_: *mut Chain) -> Result<OutputState, ChainError> {
    if !in_.is_null() {
        chain_append_all(&mut ctx.out, in_);
    }
    if chain_empty(ctx.out) {
        return Ok(OutputState::Done);
    }
    let c = ctx.connection;

    while (*(*c).write).ready && !ctx.out.is_null() {
        ctx.out = if (*(*ctx.out).buf).memory {
            let send_chain = (*c).send_chain.expect("connection send_chain not installed");
            send_chain(c, ctx.out, ctx.limit)?
        } else {
            let sendfile_chain = (*c)
                .sendfile_chain
                .expect("connection sendfile_chain not installed");
            sendfile_chain(c, ctx.out, ctx.fd, ctx.limit)?
        };
    }

    if !ctx.out.is_null() {
        return Ok(OutputState::Again);
    }
    Ok(OutputState::Done)
}

/// `chain_output` with an outer byte quota debited from `conn.sent`.
///
/// # Safety
/// Same contract as `chain_output`.
pub unsafe fn chain_output_with_limit(
    ctx: &mut ChainOutputCtx,
    limit: usize,
) -> Result<OutputState, ChainError> {
    let c = ctx.connection;
    let mut cur_limit = limit as i64;
    let mut sent = (*c).sent;

    while (*(*c).write).ready && !ctx.out.is_null() {
        ctx.out = if (*(*ctx.out).buf).memory {
            let send_chain = (*c).send_chain.expect("connection send_chain not installed");
            send_chain(c, ctx.out, cur_limit as usize)?
        } else {
            let sendfile_chain = (*c)
                .sendfile_chain
                .expect("connection sendfile_chain not installed");
            sendfile_chain(c, ctx.out, ctx.fd, cur_limit as usize)?
        };

        if !(*(*c).write).ready {
            break;
        }

        if limit != 0 {
            cur_limit -= ((*c).sent - sent) as i64;
            sent = (*c).sent;
            if cur_limit <= 0 {
                break;
            }
        }
    }

    if !ctx.out.is_null() {
        return Ok(OutputState::Again);
    }
    Ok(OutputState::Done)
}
