// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Listening sockets: creation with the usual server socket options,
// bind with bounded retry on address-in-use, and registration of the
// accept-ready read events with a reactor.

use std::io;
use std::ptr;
use std::time::Duration;

use crate::conn::{
    conn_get_from_mem, conn_nonblocking, Conn, CONN_DEFAULT_BACKLOG, CONN_DEFAULT_POOL_SIZE,
    CONN_DEFAULT_RCVBUF, CONN_DEFAULT_SNDBUF, INVALID_FD,
};
use crate::epoll::{EventBase, EVENT_READ};
use crate::event::EventHandler;

/// Listener tunables.  `bind_tries`/`bind_retry_delay_ms` govern the
/// address-in-use retry loop.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub backlog: libc::c_int,
    pub rcvbuf: libc::c_int,
    pub sndbuf: libc::c_int,
    pub conn_pool_size: usize,
    pub bind_tries: u32,
    pub bind_retry_delay_ms: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            backlog: CONN_DEFAULT_BACKLOG,
            rcvbuf: CONN_DEFAULT_RCVBUF,
            sndbuf: CONN_DEFAULT_SNDBUF,
            conn_pool_size: CONN_DEFAULT_POOL_SIZE,
            bind_tries: 5,
            bind_retry_delay_ms: 500,
        }
    }
}

/// One listening socket.
pub struct Listening {
    pub fd: libc::c_int,
    pub family: libc::c_int,
    pub sock_type: libc::c_int,
    pub sockaddr: libc::sockaddr_in,
    pub socklen: libc::socklen_t,
    pub addr_text: String,
    pub backlog: libc::c_int,
    pub rcvbuf: libc::c_int,
    pub sndbuf: libc::c_int,
    pub conn_psize: usize,
    pub handler: Option<EventHandler>,
    pub connection: *mut Conn,
    pub open: bool,
    pub listen: bool,
    pub linger: bool,
    pub ignore: bool,
    pub inherited: bool,
}

/// Append a listener for `addr:port` to the set.  Buffer sizes below the
/// defaults are clamped up.
pub fn conn_listening_add<'a>(
    listening: &'a mut Vec<Listening>,
    cfg: &ListenConfig,
    addr: u32,
    port: u16,
    handler: EventHandler,
    rbuff_len: libc::c_int,
    sbuff_len: libc::c_int,
) -> Option<&'a mut Listening> {
    if port == 0 {
        return None;
    }

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = addr.to_be();
    sin.sin_port = port.to_be();

    let o = addr.to_be_bytes();
    let ls = Listening {
        fd: INVALID_FD,
        family: libc::AF_INET,
        sock_type: libc::SOCK_STREAM,
        sockaddr: sin,
        socklen: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        addr_text: format!("{}.{}.{}.{}:{}", o[0], o[1], o[2], o[3], port),
        backlog: cfg.backlog,
        rcvbuf: rbuff_len.max(cfg.rcvbuf),
        sndbuf: sbuff_len.max(cfg.sndbuf),
        conn_psize: cfg.conn_pool_size,
        handler: Some(handler),
        connection: ptr::null_mut(),
        open: false,
        listen: false,
        linger: true,
        ignore: false,
        inherited: false,
    };
    listening.push(ls);
    listening.last_mut()
}

unsafe fn open_one(ls: &mut Listening) -> io::Result<bool> {
    let s = libc::socket(ls.family, ls.sock_type, 0);
    if s == -1 {
        let err = io::Error::last_os_error();
        log::warn!("listening_open: create socket on {} failed: {err}", ls.addr_text);
        return Err(err);
    }

    let reuseaddr: libc::c_int = 1;
    if libc::setsockopt(
        s,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &reuseaddr as *const libc::c_int as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ) == -1
    {
        let err = io::Error::last_os_error();
        log::warn!("listening_open: SO_REUSEADDR {} failed: {err}", ls.addr_text);
        libc::close(s);
        return Err(err);
    }

    if ls.rcvbuf != -1
        && libc::setsockopt(
            s,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &ls.rcvbuf as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) == -1
    {
        log::error!(
            "listening_open: SO_RCVBUF fd:{} rcvbuf:{} addr:{} failed, ignored",
            s,
            ls.rcvbuf,
            ls.addr_text
        );
    }

    if ls.sndbuf != -1
        && libc::setsockopt(
            s,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &ls.sndbuf as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) == -1
    {
        log::error!(
            "listening_open: SO_SNDBUF fd:{} sndbuf:{} addr:{} failed, ignored",
            s,
            ls.sndbuf,
            ls.addr_text
        );
    }

    if conn_nonblocking(s).is_err() {
        let err = io::Error::last_os_error();
        log::error!("listening_open: nonblocking fd:{} addr:{} failed", s, ls.addr_text);
        libc::close(s);
        return Err(err);
    }

    log::debug!("listening_open: bind fd:{} on addr:{}", s, ls.addr_text);
    if libc::bind(
        s,
        &ls.sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
        ls.socklen,
    ) == -1
    {
        let err = io::Error::last_os_error();
        log::error!("listening_open: bind fd:{} on addr:{} failed: {err}", s, ls.addr_text);
        libc::close(s);
        if err.raw_os_error() != Some(libc::EADDRINUSE) {
            return Err(err);
        }
        // Address still draining; the caller retries after a delay.
        return Ok(false);
    }

    if libc::listen(s, ls.backlog) == -1 {
        let err = io::Error::last_os_error();
        log::error!(
            "listening_open: listen fd:{} on addr:{} backlog:{} failed: {err}",
            s,
            ls.addr_text,
            ls.backlog
        );
        libc::close(s);
        return Err(err);
    }

    ls.listen = true;
    ls.open = true;
    ls.fd = s;
    log::debug!("listening_open: {} listening on fd:{}", ls.addr_text, s);
    Ok(true)
}

/// Open every listener in the set.  Bind failures with `EADDRINUSE` are
/// retried up to `cfg.bind_tries` times with `cfg.bind_retry_delay_ms`
/// sleeps; any other failure aborts.
pub fn conn_listening_open(listening: &mut [Listening], cfg: &ListenConfig) -> io::Result<()> {
    let mut tries = cfg.bind_tries.max(1);
    loop {
        let mut failed = false;

        for ls in listening.iter_mut() {
            if ls.ignore {
                continue;
            }
            if ls.fd != INVALID_FD {
                log::error!(
                    "listening_open: {} fd:{} already opened",
                    ls.addr_text,
                    ls.fd
                );
                continue;
            }
            if ls.inherited {
                continue;
            }
            if !unsafe { open_one(ls)? } {
                failed = true;
            }
        }

        if !failed {
            return Ok(());
        }
        tries -= 1;
        if tries == 0 {
            log::error!("listening_open: listening socket bind failed");
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }
        log::info!(
            "listening_open: bind failed, trying again after {} ms",
            cfg.bind_retry_delay_ms
        );
        std::thread::sleep(Duration::from_millis(cfg.bind_retry_delay_ms));
    }
}

/// Close every open listener.
pub fn conn_listening_close(listening: &mut [Listening]) {
    for ls in listening.iter_mut() {
        if ls.fd != INVALID_FD {
            unsafe { libc::close(ls.fd) };
            ls.fd = INVALID_FD;
            ls.open = false;
            ls.listen = false;
        }
    }
}

/// Give each listener a connection record flagged `accepted` and register
/// its read event, so accept readiness lands on the accept post queue.
pub fn conn_listening_add_event(
    base: &mut EventBase,
    listening: &mut [Listening],
) -> io::Result<()> {
    for ls in listening.iter_mut() {
        unsafe {
            let c = if ls.connection.is_null() {
                let c = conn_get_from_mem(ls.fd);
                (*c).listening = ls as *mut Listening;
                ls.connection = c;
                let rev = (*c).read;
                (*rev).accepted = true;
                (*rev).handler = ls.handler;
                log::debug!("listening_add_event: {} fd:{}", ls.addr_text, ls.fd);
                c
            } else {
                ls.connection
            };
            base.add_event((*c).read, EVENT_READ, 0)?;
        }
    }
    Ok(())
}

/// Deregister every listener's read event.
pub fn conn_listening_del_event(
    base: &mut EventBase,
    listening: &mut [Listening],
) -> io::Result<()> {
    for ls in listening.iter_mut() {
        if !ls.connection.is_null() {
            unsafe { base.del_event((*ls.connection).read, EVENT_READ, 0)? };
        }
    }
    Ok(())
}
