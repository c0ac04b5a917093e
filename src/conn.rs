// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection records.  A connection is a socket plus its two events, its
// io function pointers, a scratch pool, and back pointers to the owning
// reactor and timer tree.  Pooled records are recycled, never freed, and
// every recycle flips the events' instance parity so readiness reports
// from the previous life are recognised as stale.

use std::io;
use std::ptr;

use crate::epoll::{EventBase, EVENT_CLOSE_EVENT};
use crate::event::Event;
use crate::listen::Listening;
use crate::pool::{pool_destroy, Pool};
use crate::sysio::{
    sysio_readv_chain, sysio_recv, sysio_send, sysio_sendfile_chain, sysio_writev_chain,
    RecvChainFn, RecvFn, SendChainFn, SendFn, SendfileChainFn,
};
use crate::timer::EventTimer;

pub const INVALID_FD: libc::c_int = -1;

pub const CONN_DEFAULT_RCVBUF: libc::c_int = 64 << 10;
pub const CONN_DEFAULT_SNDBUF: libc::c_int = 64 << 10;
pub const CONN_DEFAULT_POOL_SIZE: usize = 2048;
pub const CONN_DEFAULT_BACKLOG: libc::c_int = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpKnob {
    #[default]
    Unset,
    Set,
    Disabled,
}

/// One connection.  Lives in a pool slot or, for listeners and the
/// wake-up pipe, in a standalone heap record.
pub struct Conn {
    pub fd: libc::c_int,
    pub next: *mut Conn,
    pub conn_data: *mut libc::c_void,
    pub read: *mut Event,
    pub write: *mut Event,
    pub recv: Option<RecvFn>,
    pub send: Option<SendFn>,
    pub recv_chain: Option<RecvChainFn>,
    pub send_chain: Option<SendChainFn>,
    pub sendfile_chain: Option<SendfileChainFn>,
    pub listening: *mut Listening,
    pub sent: usize,
    pub pool: *mut Pool,
    pub sockaddr: libc::sockaddr_in,
    pub socklen: libc::socklen_t,
    pub addr_text: String,
    pub accept_time: libc::timeval,
    pub error: bool,
    pub sendfile: bool,
    pub sndlowat: bool,
    pub tcp_nodelay: TcpKnob,
    pub tcp_nopush: TcpKnob,
    pub ev_timer: *mut EventTimer,
    pub ev_base: *mut EventBase,
}

impl Default for Conn {
    fn default() -> Self {
        Self {
            fd: INVALID_FD,
            next: ptr::null_mut(),
            conn_data: ptr::null_mut(),
            read: ptr::null_mut(),
            write: ptr::null_mut(),
            recv: None,
            send: None,
            recv_chain: None,
            send_chain: None,
            sendfile_chain: None,
            listening: ptr::null_mut(),
            sent: 0,
            pool: ptr::null_mut(),
            sockaddr: unsafe { std::mem::zeroed() },
            socklen: 0,
            addr_text: String::new(),
            accept_time: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            error: false,
            sendfile: false,
            sndlowat: false,
            tcp_nodelay: TcpKnob::Unset,
            tcp_nopush: TcpKnob::Unset,
            ev_timer: ptr::null_mut(),
            ev_base: ptr::null_mut(),
        }
    }
}

/// Peer descriptor for an outbound connection.
pub struct ConnPeer {
    pub connection: *mut Conn,
    pub sockaddr: libc::sockaddr_in,
    pub socklen: libc::socklen_t,
    pub name: String,
    pub rcvbuf: libc::c_int,
}

/// Outcome of `conn_connect_peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connected immediately; the write event is ready.
    Ok,
    /// Connect is in flight; the reactor will report write readiness.
    Again,
    /// No connection record was supplied.
    Busy,
}

/// Put `fd` into non-blocking mode.
pub fn conn_nonblocking(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Put `fd` back into blocking mode.
pub fn conn_blocking(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_tcp_opt(fd: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn conn_tcp_nopush(fd: libc::c_int) -> io::Result<()> {
    set_tcp_opt(fd, libc::TCP_CORK, 1)
}

pub fn conn_tcp_push(fd: libc::c_int) -> io::Result<()> {
    set_tcp_opt(fd, libc::TCP_CORK, 0)
}

pub fn conn_tcp_nodelay(fd: libc::c_int) -> io::Result<()> {
    set_tcp_opt(fd, libc::TCP_NODELAY, 1)
}

pub fn conn_tcp_delay(fd: libc::c_int) -> io::Result<()> {
    set_tcp_opt(fd, libc::TCP_NODELAY, 0)
}

/// Heap-allocate a standalone connection with its two events, for
/// listeners and the wake-up pipe (pooled connections come from
/// `ConnPool` instead).
pub fn conn_get_from_mem(fd: libc::c_int) -> *mut Conn {
    let c = Box::into_raw(Box::new(Conn::default()));
    let rev = Box::into_raw(Box::new(Event::new()));
    let wev = Box::into_raw(Box::new(Event::new()));
    unsafe {
        (*c).read = rev;
        (*c).write = wev;
        conn_set_default(c, fd);
    }
    c
}

/// Free a connection obtained from `conn_get_from_mem`.
///
/// # Safety
/// `c` must come from `conn_get_from_mem` and must be off the reactor.
pub unsafe fn conn_free_mem(c: *mut Conn) {
    drop(Box::from_raw((*c).read));
    drop(Box::from_raw((*c).write));
    drop(Box::from_raw(c));
}

/// Re-arm a connection record for a new life on `fd`.  The events are
/// zeroed and their instance parity flipped, which is what invalidates
/// any readiness notification still in flight for the previous life.
///
/// # Safety
/// `c` must have valid `read`/`write` event pointers.
pub unsafe fn conn_set_default(c: *mut Conn, fd: libc::c_int) {
    (*c).fd = fd;

    let rev = (*c).read;
    let wev = (*c).write;
    let instance = (*rev).instance;
    let last_instance = (*rev).last_instance;

    (*c).sent = 0;
    (*c).conn_data = ptr::null_mut();
    (*c).next = ptr::null_mut();
    (*c).error = false;
    (*c).listening = ptr::null_mut();
    (*c).sendfile = false;
    (*c).sndlowat = false;
    (*c).sockaddr = std::mem::zeroed();
    (*c).socklen = 0;
    (*c).addr_text.clear();

    (*rev).reset();
    (*wev).reset();
    (*rev).instance = (instance == 0) as u8;
    (*wev).instance = (instance == 0) as u8;
    (*rev).last_instance = last_instance;

    (*rev).data = c as *mut libc::c_void;
    (*wev).data = c as *mut libc::c_void;
    (*wev).write = true;
}

/// Close the socket: shut the fd, disarm both timers, and tell the
/// reactor the kernel entry is already gone.
///
/// # Safety
/// `c` must be a valid connection record.
pub unsafe fn conn_close(c: *mut Conn) {
    if c.is_null() {
        return;
    }
    if (*c).fd > 0 {
        libc::close((*c).fd);
        (*c).fd = INVALID_FD;

        if !(*c).ev_timer.is_null() {
            if (*(*c).read).timer_set {
                (*(*c).ev_timer).del_timer((*c).read);
            }
            if (*(*c).write).timer_set {
                (*(*c).ev_timer).del_timer((*c).write);
            }
        }

        if !(*c).ev_base.is_null() {
            let _ = (*(*c).ev_base).del_conn(c, EVENT_CLOSE_EVENT);
        }
    }
}

/// `conn_close` plus destruction of the scratch pool.
///
/// # Safety
/// `c` must be a valid connection record.
pub unsafe fn conn_release(c: *mut Conn) {
    conn_close(c);
    if !(*c).pool.is_null() {
        pool_destroy((*c).pool);
    }
    (*c).pool = ptr::null_mut();
}

/// Start a non-blocking connect to `pc`'s peer: create the socket,
/// install the io function pointers, register with the reactor, then
/// issue connect(2).  `EINPROGRESS` reports `Again`; the reactor will
/// deliver write readiness when the handshake finishes.
///
/// # Safety
/// `pc.connection`, when set, must be a valid re-armable record.
pub unsafe fn conn_connect_peer(pc: &mut ConnPeer, ep_base: &mut EventBase) -> io::Result<ConnectStatus> {
    let c = pc.connection;
    if c.is_null() {
        return Ok(ConnectStatus::Busy);
    }

    if (*c).fd == INVALID_FD {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd == -1 {
            let err = io::Error::last_os_error();
            log::error!("conn_connect_peer: socket failed: {err}");
            return Err(err);
        }
        (*c).fd = fd;
        conn_nonblocking(fd)?;

        (*c).recv = Some(sysio_recv);
        (*c).send = Some(sysio_send);
        (*c).recv_chain = Some(sysio_readv_chain);
        (*c).send_chain = Some(sysio_writev_chain);
        (*c).sendfile_chain = Some(sysio_sendfile_chain);
        (*c).sendfile = true;
        (*c).tcp_nodelay = TcpKnob::Unset;
        (*c).tcp_nopush = TcpKnob::Unset;
    }

    ep_base.add_conn(c)?;

    let rc = libc::connect(
        (*c).fd,
        &pc.sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
        pc.socklen,
    );
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(ConnectStatus::Again);
        }
        log::error!("conn_connect_peer: connect to {} failed: {err}", pc.name);
        return Err(err);
    }

    (*(*c).write).ready = true;
    Ok(ConnectStatus::Ok)
}
