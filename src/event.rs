// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Event records and the posted-event drain.  An event is one direction
// (read or write) of a connection; its record is pre-allocated next to the
// connection and re-armed in place on reuse.

use crate::conn::{Conn, INVALID_FD};
use crate::queue::{queue_data, queue_empty, queue_head, queue_remove, Queue};
use crate::rbtree::RbtreeNode;

/// Event handlers are plain function pointers: events live inside
/// pre-allocated arrays, so there is nowhere to stash a closure.  State
/// rides on `Event::data`.
pub type EventHandler = fn(ev: *mut Event);

/// One direction of a connection (or of the wake-up pipe).
///
/// `instance` is the one-bit incarnation counter: it is captured into the
/// kernel registration alongside the connection pointer and compared at
/// dispatch, which is the sole defense against readiness reports for a
/// connection that was closed and reused in the meantime.
#[repr(C)]
pub struct Event {
    /// Back pointer to the owning `Conn`.
    pub data: *mut libc::c_void,
    pub handler: Option<EventHandler>,
    pub timer: RbtreeNode,
    pub post_queue: Queue,
    pub instance: u8,
    pub last_instance: u8,
    pub write: bool,
    pub active: bool,
    pub ready: bool,
    pub accepted: bool,
    pub timedout: bool,
    pub timer_set: bool,
    pub timer_event: bool,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            data: std::ptr::null_mut(),
            handler: None,
            timer: RbtreeNode::new(),
            post_queue: Queue::new(),
            instance: 0,
            last_instance: 0,
            write: false,
            active: false,
            ready: false,
            accepted: false,
            timedout: false,
            timer_set: false,
            timer_event: false,
        }
    }

    /// Zero the record while keeping the incarnation counters, exactly
    /// what re-arming a pooled connection needs.
    pub fn reset(&mut self) {
        let instance = self.instance;
        let last_instance = self.last_instance;
        *self = Event::new();
        self.instance = instance;
        self.last_instance = last_instance;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one posted-event queue head-to-tail.  A handler may re-post;
/// entries whose connection was closed while queued (fd already invalid)
/// are dropped as stale.
///
/// # Safety
/// `posted` must be an initialised queue threading `Event::post_queue`
/// links whose events (and their connections) are still allocated.
pub unsafe fn event_process_posted(posted: *mut Queue) {
    while !queue_empty(posted) {
        let eq = queue_head(posted);
        queue_remove(eq);
        let ev = queue_data!(eq, Event, post_queue);

        let c = (*ev).data as *mut Conn;
        if (*c).fd == INVALID_FD {
            log::debug!("process_posted: stale event, conn {:p}", c);
            continue;
        }
        log::trace!(
            "process_posted: fd:{} write:{} timer key:{}",
            (*c).fd,
            (*ev).write,
            (*ev).timer.key
        );
        if let Some(handler) = (*ev).handler {
            handler(ev);
        }
    }
}
