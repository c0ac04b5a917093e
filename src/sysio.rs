// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Socket I/O primitives installed on connections as function pointers:
// single-buffer recv/send, scatter reads, gathered writes coalescing a
// chain into iovecs, and sendfile for file buffers.  EINTR is retried at
// every call site; EAGAIN clears the direction's ready flag and reports
// `Again` so the reactor re-arms instead of spinning.

use std::io;

use thiserror::Error;

use crate::buffer::buffer_size;
use crate::chain::{chain_write_update, Chain};
use crate::conn::Conn;

/// Most iovec slots packed into one writev.
pub const IOVS_MAX: usize = 64;

/// Most iovec slots filled by a scatter read.
pub const IOVS_REV: usize = 16;

/// Hard cap per output pass: 2 GiB minus a page, the classic sendfile
/// count limit.
pub const MAX_LIMIT: usize = (1 << 31) - 4096;

/// Result of a single-buffer or scatter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Bytes transferred.
    Done(usize),
    /// The peer closed (read side) or accepted nothing (write side).
    Eof,
    /// The socket is not ready; the ready flag was cleared.
    Again,
    /// A hard error, already logged.
    Error,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("writev failed")]
    Writev(#[source] io::Error),
    #[error("sendfile failed")]
    Sendfile(#[source] io::Error),
    #[error("sendfile sent nothing, file position out of range")]
    SendfileZero,
}

pub type RecvFn = fn(c: *mut Conn, buf: *mut u8, size: usize) -> IoStatus;
pub type SendFn = fn(c: *mut Conn, buf: *mut u8, size: usize) -> IoStatus;
pub type RecvChainFn = fn(c: *mut Conn, chain: *mut Chain) -> IoStatus;
pub type SendChainFn = fn(c: *mut Conn, in_: *mut Chain, limit: usize) -> Result<*mut Chain, ChainError>;
pub type SendfileChainFn =
    fn(c: *mut Conn, in_: *mut Chain, fd: libc::c_int, limit: usize) -> Result<*mut Chain, ChainError>;

/// recv(2) into one buffer.
pub fn sysio_recv(c: *mut Conn, buf: *mut u8, size: usize) -> IoStatus {
    unsafe {
        loop {
            let n = libc::recv((*c).fd, buf as *mut libc::c_void, size, 0);
            log::trace!("sysio_recv: recv:{} size:{} fd:{}", n, size, (*c).fd);
            if n > 0 {
                return IoStatus::Done(n as usize);
            }
            if n == 0 {
                return IoStatus::Eof;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    log::trace!("sysio_recv: not ready");
                    return IoStatus::Again;
                }
                _ => {
                    log::warn!("sysio_recv: error on fd:{}: {err}", (*c).fd);
                    return IoStatus::Error;
                }
            }
        }
    }
}

/// recv(2) for datagram sockets: zero-length reads are data, not EOF.
pub fn sysio_udp_recv(c: *mut Conn, buf: *mut u8, size: usize) -> IoStatus {
    unsafe {
        loop {
            let n = libc::recv((*c).fd, buf as *mut libc::c_void, size, 0);
            if n >= 0 {
                return IoStatus::Done(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return IoStatus::Again,
                _ => {
                    log::warn!("sysio_udp_recv: error on fd:{}: {err}", (*c).fd);
                    return IoStatus::Error;
                }
            }
        }
    }
}

/// Scatter read into the chain's free tails.  Cursors are not advanced;
/// the caller applies `chain_read_update` with the returned count.
pub fn sysio_readv_chain(c: *mut Conn, chain: *mut Chain) -> IoStatus {
    let mut iovs: [libc::iovec; IOVS_REV] = unsafe { std::mem::zeroed() };
    let mut i = 0usize;

    unsafe {
        // Coalesce neighbouring buffers that continue each other.
        let mut prev: *mut u8 = std::ptr::null_mut();
        let mut cl = chain;
        while !cl.is_null() && i < IOVS_REV {
            let b = (*cl).buf;
            let room = (*b).end as usize - (*b).last as usize;
            if prev == (*b).last {
                iovs[i - 1].iov_len += room;
            } else {
                iovs[i].iov_base = (*b).last as *mut libc::c_void;
                iovs[i].iov_len = room;
                i += 1;
            }
            prev = (*b).end;
            cl = (*cl).next;
        }

        loop {
            let n = libc::readv((*c).fd, iovs.as_ptr(), i as libc::c_int);
            log::trace!("sysio_readv_chain: read:{} fd:{}", n, (*c).fd);
            if n > 0 {
                return IoStatus::Done(n as usize);
            }
            if n == 0 {
                return IoStatus::Eof;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return IoStatus::Again,
                Some(libc::EINTR) => continue,
                _ => {
                    log::warn!("sysio_readv_chain: error on fd:{}: {err}", (*c).fd);
                    return IoStatus::Error;
                }
            }
        }
    }
}

/// send(2) from one buffer.  A partial or zero send clears write-ready.
pub fn sysio_send(c: *mut Conn, buf: *mut u8, size: usize) -> IoStatus {
    unsafe {
        let wev = (*c).write;
        loop {
            let n = libc::send((*c).fd, buf as *const libc::c_void, size, 0);
            log::trace!("sysio_send: send:{} size:{} fd:{}", n, size, (*c).fd);
            if n > 0 {
                if (n as usize) < size {
                    (*wev).ready = false;
                }
                return IoStatus::Done(n as usize);
            }
            if n == 0 {
                log::warn!("sysio_send: send returned zero, fd:{}", (*c).fd);
                (*wev).ready = false;
                return IoStatus::Eof;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    (*wev).ready = false;
                    log::trace!("sysio_send: not ready");
                    return IoStatus::Again;
                }
                _ => {
                    log::warn!("sysio_send: error on fd:{}: {err}", (*c).fd);
                    return IoStatus::Error;
                }
            }
        }
    }
}

/// Pack leading memory buffers into iovecs, clamped by `limit`.  Buffers
/// whose `pos` repeats the previous one extend the previous slot.
unsafe fn pack_chain_to_iovs(
    iovs: &mut [libc::iovec],
    mut in_: *mut Chain,
    packed: &mut usize,
    limit: usize,
) -> usize {
    let mut i = 0usize;
    let mut last_pos: *mut u8 = std::ptr::null_mut();

    while !in_.is_null() && i < iovs.len() && *packed < limit {
        let b = (*in_).buf;
        if !(*b).memory {
            break;
        }
        let mut bsize = buffer_size(b);
        if bsize == 0 {
            in_ = (*in_).next;
            continue;
        }
        if *packed + bsize > limit {
            bsize = limit - *packed;
        }
        if last_pos != (*b).pos {
            iovs[i].iov_base = (*b).pos as *mut libc::c_void;
            iovs[i].iov_len = bsize;
            i += 1;
        } else {
            iovs[i - 1].iov_len += bsize;
        }
        *packed += bsize;
        last_pos = (*b).pos;
        in_ = (*in_).next;
    }

    i
}

unsafe fn writev_iovs(c: *mut Conn, iovs: &[libc::iovec], count: usize) -> IoStatus {
    loop {
        let rc = libc::writev((*c).fd, iovs.as_ptr(), count as libc::c_int);
        if rc > 0 {
            return IoStatus::Done(rc as usize);
        }
        if rc == 0 {
            return IoStatus::Error;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return IoStatus::Again,
            _ => {
                log::warn!("writev_iovs: error on fd:{}: {err}", (*c).fd);
                return IoStatus::Error;
            }
        }
    }
}

/// Gathered write of the chain's leading memory buffers, up to `limit`
/// bytes.  Returns the first unsent node, null when the run was fully
/// sent; on `EAGAIN` write-ready is cleared and the current head comes
/// back unchanged.
pub fn sysio_writev_chain(c: *mut Conn, in_: *mut Chain, limit: usize) -> Result<*mut Chain, ChainError> {
    if in_.is_null() {
        return Ok(std::ptr::null_mut());
    }
    unsafe {
        let wev = (*c).write;
        if !(*wev).ready {
            return Ok(in_);
        }

        let limit = if limit == 0 || limit > MAX_LIMIT {
            MAX_LIMIT
        } else {
            limit
        };

        let mut iovs: [libc::iovec; IOVS_MAX] = std::mem::zeroed();
        let mut in_ = in_;
        let mut packed = 0usize;

        while !in_.is_null() && packed < limit {
            if !(*(*in_).buf).memory {
                log::trace!("sysio_writev_chain: file buffer, memory run ends");
                break;
            }
            let pack_count = pack_chain_to_iovs(&mut iovs, in_, &mut packed, limit);
            if pack_count == 0 {
                return Ok(std::ptr::null_mut());
            }

            match writev_iovs(c, &iovs, pack_count) {
                IoStatus::Done(sent) => {
                    (*c).sent += sent;
                    let cl = chain_write_update(in_, sent);
                    if packed >= limit {
                        return Ok(cl);
                    }
                    in_ = cl;
                }
                IoStatus::Again => {
                    (*wev).ready = false;
                    return Ok(in_);
                }
                IoStatus::Eof | IoStatus::Error => {
                    return Err(ChainError::Writev(io::Error::last_os_error()));
                }
            }
        }

        Ok(in_)
    }
}

/// Push the chain's leading file buffers with sendfile(2), up to `limit`
/// bytes from descriptor `fd`.  The kernel advances `file_pos` through
/// the passed offset.
pub fn sysio_sendfile_chain(
    c: *mut Conn,
    in_: *mut Chain,
    fd: libc::c_int,
    limit: usize,
) -> Result<*mut Chain, ChainError> {
    if in_.is_null() {
        return Ok(std::ptr::null_mut());
    }
    unsafe {
        let wev = (*c).write;
        if !(*wev).ready {
            return Ok(in_);
        }

        let limit = if limit == 0 || limit > MAX_LIMIT {
            MAX_LIMIT
        } else {
            limit
        };
        log::trace!("sysio_sendfile_chain: limit:{} fd:{}", limit, fd);

        let mut in_ = in_;
        let mut sent = 0usize;
        while !in_.is_null() && sent < limit {
            let b = (*in_).buf;
            if (*b).memory {
                log::trace!("sysio_sendfile_chain: memory buffer, file run ends");
                break;
            }
            let mut pack_size = buffer_size(b);
            if pack_size == 0 {
                in_ = (*in_).next;
                continue;
            }
            if sent + pack_size > limit {
                pack_size = limit - sent;
            }

            let rc = libc::sendfile((*c).fd, fd, &mut (*b).file_pos, pack_size);
            if rc == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => {
                        (*wev).ready = false;
                        return Ok(in_);
                    }
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::warn!("sysio_sendfile_chain: error on fd:{}: {err}", (*c).fd);
                        return Err(ChainError::Sendfile(err));
                    }
                }
            }
            if rc == 0 {
                log::error!("sysio_sendfile_chain: sendfile sent nothing, bad file position");
                return Err(ChainError::SendfileZero);
            }

            (*c).sent += rc as usize;
            sent += rc as usize;
            if buffer_size(b) == 0 {
                in_ = (*in_).next;
            }
        }

        Ok(in_)
    }
}
