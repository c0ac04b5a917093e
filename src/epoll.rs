// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The reactor: an edge-triggered epoll loop.  One kernel entry exists per
// fd; registering the second direction converts ADD into MOD and keeps the
// first direction's bit.  The kernel user-data word carries the connection
// pointer with the event's instance parity in the low bit, so readiness
// reports that outlive a close-and-reuse are recognised and dropped.

use std::io;

use crate::conn::{Conn, INVALID_FD};
use crate::event::Event;
use crate::queue::{queue_init, queue_insert_tail, Queue};

/// Direction values double as the epoll interest bits.
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;
pub const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

/// Edge-trigger flag for `add_event`/`del_event`.
pub const EVENT_CLEAR: u32 = libc::EPOLLET as u32;

/// `process_events` flags.
pub const EVENT_UPDATE_TIME: u32 = 0x1;
pub const EVENT_POST_EVENTS: u32 = 0x2;

/// `del_event`/`del_conn` flag: the fd is already closed, the kernel has
/// dropped the registration on its own.
pub const EVENT_CLOSE_EVENT: u32 = 0x4;

/// The per-worker reactor state.
pub struct EventBase {
    ep: libc::c_int,
    event_list: Vec<libc::epoll_event>,
    /// Cached-clock refresh hook, run when `EVENT_UPDATE_TIME` is passed.
    pub time_update: Option<fn()>,
    // Boxed so the intrusive queue sentinels survive moves of the base.
    posted_accept_events: Box<Queue>,
    posted_events: Box<Queue>,
}

impl EventBase {
    /// Create the epoll instance and size the report buffer to `nevents`.
    pub fn init(nevents: usize) -> io::Result<Self> {
        let ep = unsafe { libc::epoll_create1(0) };
        if ep == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll_init: epoll_create failed: {err}");
            return Err(err);
        }

        let mut posted_accept_events = Box::new(Queue::new());
        let mut posted_events = Box::new(Queue::new());
        unsafe {
            queue_init(&mut *posted_accept_events);
            queue_init(&mut *posted_events);
        }

        Ok(Self {
            ep,
            event_list: vec![libc::epoll_event { events: 0, u64: 0 }; nevents.max(1)],
            time_update: None,
            posted_accept_events,
            posted_events,
        })
    }

    pub fn posted_accept_events(&mut self) -> *mut Queue {
        &mut *self.posted_accept_events
    }

    pub fn posted_events(&mut self) -> *mut Queue {
        &mut *self.posted_events
    }

    fn tag(c: *mut Conn, instance: u8) -> u64 {
        c as u64 | instance as u64
    }

    /// Register one direction of `ev`'s connection.  When the opposite
    /// direction is already active this becomes a MOD that preserves it.
    ///
    /// # Safety
    /// `ev` must belong to a live connection with a valid fd.
    pub unsafe fn add_event(&mut self, ev: *mut Event, event: u32, flags: u32) -> io::Result<()> {
        let c = (*ev).data as *mut Conn;

        let (aevent, aevents) = if event == EVENT_READ {
            ((*c).write, EVENT_WRITE)
        } else {
            ((*c).read, EVENT_READ)
        };

        // The other direction is live in the kernel entry; keep its bit.
        let (op, events) = if (*aevent).active {
            (libc::EPOLL_CTL_MOD, event | aevents)
        } else {
            (libc::EPOLL_CTL_ADD, event)
        };

        let mut ee = libc::epoll_event {
            events: events | flags,
            u64: Self::tag(c, (*ev).instance),
        };

        (*ev).active = true;

        if libc::epoll_ctl(self.ep, op, (*c).fd, &mut ee) == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll add_event: fd:{} op:{} failed: {err}", (*c).fd, op);
            (*ev).active = false;
            return Err(err);
        }

        Ok(())
    }

    /// Deregister one direction.  With `EVENT_CLOSE_EVENT` the fd was
    /// closed already and the kernel entry is gone; only the flag drops.
    ///
    /// # Safety
    /// `ev` must belong to a live connection record.
    pub unsafe fn del_event(&mut self, ev: *mut Event, event: u32, flags: u32) -> io::Result<()> {
        let c = (*ev).data as *mut Conn;

        if flags & EVENT_CLOSE_EVENT != 0 {
            (*ev).active = false;
            return Ok(());
        }

        let (aevent, aevents) = if event == EVENT_READ {
            ((*c).write, EVENT_WRITE)
        } else {
            ((*c).read, EVENT_READ)
        };

        let (op, mut ee) = if (*aevent).active {
            (
                libc::EPOLL_CTL_MOD,
                libc::epoll_event {
                    events: aevents | flags,
                    u64: Self::tag(c, (*ev).instance),
                },
            )
        } else {
            (
                libc::EPOLL_CTL_DEL,
                libc::epoll_event {
                    events: event,
                    u64: 0,
                },
            )
        };

        if libc::epoll_ctl(self.ep, op, (*c).fd, &mut ee) == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll del_event: fd:{} op:{} failed: {err}", (*c).fd, op);
            return Err(err);
        }

        (*ev).active = false;
        Ok(())
    }

    /// Register both directions of `c` edge-triggered in one entry.
    ///
    /// # Safety
    /// `c` must be a live connection with a valid fd.
    pub unsafe fn add_conn(&mut self, c: *mut Conn) -> io::Result<()> {
        let mut ee = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
            u64: Self::tag(c, (*(*c).read).instance),
        };

        if libc::epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, (*c).fd, &mut ee) == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll add_conn: fd:{} failed: {err}", (*c).fd);
            return Err(err);
        }

        (*(*c).read).active = true;
        (*(*c).write).active = true;

        Ok(())
    }

    /// Drop `c`'s kernel entry; with `EVENT_CLOSE_EVENT` only the flags.
    ///
    /// # Safety
    /// `c` must be a live connection record.
    pub unsafe fn del_conn(&mut self, c: *mut Conn, flags: u32) -> io::Result<()> {
        if flags & EVENT_CLOSE_EVENT != 0 {
            (*(*c).read).active = false;
            (*(*c).write).active = false;
            return Ok(());
        }

        let mut ee = libc::epoll_event { events: 0, u64: 0 };
        if libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, (*c).fd, &mut ee) == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll del_conn: fd:{} failed: {err}", (*c).fd);
            return Err(err);
        }

        (*(*c).read).active = false;
        (*(*c).write).active = false;

        Ok(())
    }

    /// One reactor turn: wait up to `timer` ms (−1 = forever), then
    /// dispatch or post every reported event that is still current.
    ///
    /// # Safety
    /// Every tagged pointer that can come back from the kernel must refer
    /// to a connection record that is still allocated (pooled records
    /// satisfy this: close recycles them but never frees them).
    pub unsafe fn process_events(&mut self, timer: i64, flags: u32) -> io::Result<usize> {
        let events_num = libc::epoll_wait(
            self.ep,
            self.event_list.as_mut_ptr(),
            self.event_list.len() as libc::c_int,
            timer as libc::c_int,
        );

        if flags & EVENT_UPDATE_TIME != 0 {
            if let Some(update) = self.time_update {
                update();
            }
        }

        if events_num == -1 {
            let err = io::Error::last_os_error();
            log::error!("epoll process_events: epoll_wait failed: {err}");
            return Err(err);
        }
        if events_num == 0 {
            if timer != -1 {
                return Ok(0);
            }
            log::error!("epoll process_events: no events on an infinite wait");
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "epoll_wait returned no events without timeout",
            ));
        }

        let mut handled = 0usize;
        for i in 0..events_num as usize {
            let tagged = self.event_list[i].u64;
            let instance = (tagged & 1) as u8;
            let c = (tagged & !1) as *mut Conn;

            let rev = (*c).read;
            if (*c).fd == INVALID_FD || (*rev).instance != instance {
                // Readiness for an incarnation that was closed in this
                // same iteration; the slot has moved on.
                log::debug!("epoll process_events: stale event {:p}", c);
                continue;
            }

            let mut events = self.event_list[i].events;
            if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                log::debug!(
                    "epoll process_events: error events on fd:{} ev:{:#x}",
                    (*c).fd,
                    events
                );
            }
            if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0
                && events & (libc::EPOLLIN | libc::EPOLLOUT) as u32 == 0
            {
                // Surface the error to at least one active handler.
                events |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            }

            if events & EVENT_READ != 0 && (*rev).active {
                (*rev).ready = true;
                match (*rev).handler {
                    None => {
                        log::debug!("epoll process_events: read handler missing fd:{}", (*c).fd);
                        continue;
                    }
                    Some(handler) => {
                        if flags & EVENT_POST_EVENTS != 0 {
                            let queue = if (*rev).accepted {
                                &mut *self.posted_accept_events as *mut Queue
                            } else {
                                &mut *self.posted_events as *mut Queue
                            };
                            (*rev).last_instance = instance;
                            queue_insert_tail(queue, &mut (*rev).post_queue);
                        } else {
                            handler(rev);
                            handled += 1;
                        }
                    }
                }
            }

            let wev = (*c).write;
            if events & EVENT_WRITE != 0 && (*wev).active {
                (*wev).ready = true;
                match (*wev).handler {
                    None => {
                        log::warn!("epoll process_events: write handler missing fd:{}", (*c).fd);
                        continue;
                    }
                    Some(handler) => {
                        if flags & EVENT_POST_EVENTS != 0 {
                            (*rev).last_instance = instance;
                            queue_insert_tail(
                                &mut *self.posted_events,
                                &mut (*wev).post_queue,
                            );
                        } else {
                            handler(wev);
                            handled += 1;
                        }
                    }
                }
            }
        }

        Ok(handled)
    }

    /// Make sure read interest is registered edge-triggered; a no-op when
    /// the direction is already armed or has unconsumed readiness.
    ///
    /// # Safety
    /// `rev` must belong to a live connection.
    pub unsafe fn handle_read(&mut self, rev: *mut Event) -> io::Result<()> {
        if !(*rev).active && !(*rev).ready {
            self.add_event(rev, EVENT_READ, EVENT_CLEAR)?;
        }
        Ok(())
    }

    /// # Safety
    /// `rev` must belong to a live connection.
    pub unsafe fn del_read(&mut self, rev: *mut Event) -> io::Result<()> {
        (*rev).ready = false;
        self.del_event(rev, EVENT_READ, EVENT_CLEAR)
    }

    /// Write-side counterpart of `handle_read`.
    ///
    /// # Safety
    /// `wev` must belong to a live connection.
    pub unsafe fn handle_write(&mut self, wev: *mut Event) -> io::Result<()> {
        if !(*wev).active && !(*wev).ready {
            self.add_event(wev, EVENT_WRITE, EVENT_CLEAR)?;
        } else {
            log::trace!("handle_write: already registered");
        }
        Ok(())
    }

    /// # Safety
    /// `wev` must belong to a live connection.
    pub unsafe fn del_write(&mut self, wev: *mut Event) -> io::Result<()> {
        (*wev).ready = false;
        self.del_event(wev, EVENT_WRITE, EVENT_CLEAR)
    }
}

impl Drop for EventBase {
    fn drop(&mut self) {
        if self.ep != -1 {
            if unsafe { libc::close(self.ep) } == -1 {
                log::error!("epoll close() failed: {}", io::Error::last_os_error());
            }
            self.ep = -1;
        }
    }
}
