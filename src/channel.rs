// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Worker-to-worker command transport: a socketpair carrying one fixed
// `ChannelMsg` per message, plus — for OPEN only — one file descriptor as
// SCM_RIGHTS ancillary data.  Commands themselves are opaque to this
// layer; only the transport and the fd passing are specified here.

use std::io;
use std::mem;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel: socket not ready")]
    Again,
    #[error("channel: peer closed")]
    Closed,
    #[error("channel: short message")]
    ShortRead,
    #[error("channel: OPEN without a valid SCM_RIGHTS record")]
    NoRights,
    #[error("channel: syscall failed")]
    Syscall(#[source] io::Error),
}

pub const CHANNEL_CMD_OPEN: u32 = 1;
pub const CHANNEL_CMD_CLOSE: u32 = 2;
pub const CHANNEL_CMD_QUIT: u32 = 3;
pub const CHANNEL_CMD_TERMINATE: u32 = 4;

/// The fixed wire struct.  `fd` rides as ancillary data when
/// `command == CHANNEL_CMD_OPEN` and is -1 otherwise.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChannelMsg {
    pub command: u32,
    pub pid: libc::pid_t,
    pub slot: i32,
    pub fd: libc::c_int,
}

impl ChannelMsg {
    pub fn new(command: u32) -> Self {
        Self {
            command,
            pid: unsafe { libc::getpid() },
            slot: 0,
            fd: -1,
        }
    }
}

/// Ancillary buffer with cmsghdr alignment, mirroring the classic
/// `union { struct cmsghdr cm; char space[CMSG_SPACE(sizeof(int))]; }`.
#[repr(C)]
union CmsgSpace {
    cm: libc::cmsghdr,
    space: [u8; 32],
}

/// Create the worker socketpair (non-blocking is the caller's choice).
pub fn channel_pair() -> io::Result<[libc::c_int; 2]> {
    let mut fds = [-1 as libc::c_int; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fds)
}

/// Send `ch` down `socket`; an OPEN command attaches `ch.fd` as
/// SCM_RIGHTS.
pub fn channel_write(socket: libc::c_int, ch: &ChannelMsg) -> Result<(), ChannelError> {
    unsafe {
        let mut cmsg: CmsgSpace = mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: ch as *const ChannelMsg as *mut libc::c_void,
            iov_len: mem::size_of::<ChannelMsg>(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if ch.fd != -1 {
            msg.msg_control = &mut cmsg as *mut CmsgSpace as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as usize;

            let cm = libc::CMSG_FIRSTHDR(&msg);
            (*cm).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as usize;
            (*cm).cmsg_level = libc::SOL_SOCKET;
            (*cm).cmsg_type = libc::SCM_RIGHTS;
            std::ptr::copy_nonoverlapping(
                &ch.fd as *const libc::c_int as *const u8,
                libc::CMSG_DATA(cm),
                mem::size_of::<libc::c_int>(),
            );
        }

        let n = libc::sendmsg(socket, &msg, 0);
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Err(ChannelError::Again);
            }
            return Err(ChannelError::Syscall(err));
        }
    }
    Ok(())
}

/// Receive one message into `ch`.  For OPEN the ancillary data must be
/// exactly one descriptor, validated before it is extracted.
pub fn channel_read(socket: libc::c_int, ch: &mut ChannelMsg) -> Result<usize, ChannelError> {
    unsafe {
        let mut cmsg: CmsgSpace = mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: ch as *mut ChannelMsg as *mut libc::c_void,
            iov_len: mem::size_of::<ChannelMsg>(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = &mut cmsg as *mut CmsgSpace as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as usize;

        let n = libc::recvmsg(socket, &mut msg, 0);
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Err(ChannelError::Again);
            }
            return Err(ChannelError::Syscall(err));
        }
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        if (n as usize) < mem::size_of::<ChannelMsg>() {
            log::error!("channel_read: message truncated to {n} bytes");
            return Err(ChannelError::ShortRead);
        }

        if ch.command == CHANNEL_CMD_OPEN {
            let cm = libc::CMSG_FIRSTHDR(&msg);
            if cm.is_null()
                || (*cm).cmsg_len < libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as usize
            {
                log::error!("channel_read: OPEN with missing descriptor");
                return Err(ChannelError::NoRights);
            }
            if (*cm).cmsg_level != libc::SOL_SOCKET || (*cm).cmsg_type != libc::SCM_RIGHTS {
                log::error!("channel_read: OPEN with bad ancillary record");
                return Err(ChannelError::NoRights);
            }
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cm),
                &mut ch.fd as *mut libc::c_int as *mut u8,
                mem::size_of::<libc::c_int>(),
            );
        }

        Ok(n as usize)
    }
}

/// Close both ends of a channel pair.
pub fn channel_close(fds: &mut [libc::c_int; 2]) {
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    fds[0] = -1;
    fds[1] = -1;
}
