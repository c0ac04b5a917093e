// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Self-pipe wake-up: any thread writes one byte, the reactor's read
// handler drains the pipe and runs the installed callback.  This is the
// only way to break the reactor out of its kernel wait from outside.

use std::io;

use crate::conn::{conn_free_mem, conn_get_from_mem, conn_nonblocking, Conn};
use crate::epoll::{EventBase, EVENT_READ};
use crate::event::Event;
use crate::pipe::{pipe_close, pipe_open, Pipe};

const NOTICE_BUFF_SIZE: usize = 1024;

pub type WakeUpHandler = fn(data: *mut libc::c_void);

/// Wake-up channel state; one per worker, owned by the caller and wired
/// into that worker's reactor.
pub struct Notice {
    pub channel: Pipe,
    call_back: Option<WakeUpHandler>,
    data: *mut libc::c_void,
}

unsafe impl Send for Notice {}
unsafe impl Sync for Notice {}

impl Notice {
    pub const fn new() -> Self {
        Self {
            channel: Pipe::new(),
            call_back: None,
            data: std::ptr::null_mut(),
        }
    }
}

impl Default for Notice {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the pipe, wrap its read end in a heap connection and register it
/// with the reactor.
///
/// # Safety
/// `n` must outlive the reactor registration; `data` whatever the
/// callback expects.
pub unsafe fn notice_init(
    base: &mut EventBase,
    n: *mut Notice,
    handler: WakeUpHandler,
    data: *mut libc::c_void,
) -> io::Result<()> {
    pipe_open(&mut (*n).channel)?;

    let c = conn_get_from_mem((*n).channel.pfd[0]);
    let result = (|| -> io::Result<()> {
        conn_nonblocking((*n).channel.pfd[0])?;
        conn_nonblocking((*n).channel.pfd[1])?;
        (*n).call_back = Some(handler);
        (*n).data = data;

        (*c).ev_base = base as *mut EventBase;
        (*c).conn_data = n as *mut libc::c_void;

        let rev = (*c).read;
        (*rev).handler = Some(notice_read_event_handler);

        base.add_event(rev, EVENT_READ, 0)
    })();

    if let Err(err) = result {
        log::error!("notice_init: registering the wake-up pipe failed: {err}");
        pipe_close(&mut (*n).channel);
        conn_free_mem(c);
        return Err(err);
    }

    Ok(())
}

/// Wake the owning reactor: one byte down the pipe.  A full pipe means a
/// wake-up is already pending, which is just as good.
pub fn notice_wake_up(n: &Notice) {
    let rc = unsafe { libc::write(n.channel.pfd[1], b"C".as_ptr() as *const libc::c_void, 1) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            log::error!("notice_wake_up: write failed: {err}");
        }
    }
}

fn notice_read_event_handler(ev: *mut Event) {
    unsafe {
        let c = (*ev).data as *mut Conn;
        let nt = (*c).conn_data as *mut Notice;
        let mut buff = [0u8; NOTICE_BUFF_SIZE];

        loop {
            let n = libc::read(
                (*nt).channel.pfd[0],
                buff.as_mut_ptr() as *mut libc::c_void,
                NOTICE_BUFF_SIZE,
            );
            if n > 0 {
                continue;
            }
            if n == 0 {
                log::error!("notice: pipe fd:{} read 0 bytes", (*nt).channel.pfd[0]);
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                _ => {
                    log::error!("notice: pipe fd:{} read failed: {err}", (*nt).channel.pfd[0]);
                    break;
                }
            }
        }

        if let Some(cb) = (*nt).call_back {
            cb((*nt).data);
        }
    }
}
