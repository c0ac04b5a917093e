// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Timer tree: events are keyed by absolute deadline on an intrusive
// red-black tree.  Re-arming an event within the lazy-delay window of its
// current deadline is a no-op, which keeps fast connections from churning
// the tree on every round trip.

use crate::event::Event;
use crate::rbtree::{rbtree_insert_timer_value, Rbtree, RbtreeNode};

/// Wait forever (the reactor passes this through to the kernel wait).
pub const TIMER_INFINITE: i64 = -1;

/// Re-arm slack in milliseconds.
pub const TIMER_LAZY_DELAY: i64 = 300;

/// Millisecond clock used for deadlines.  Workers normally install a
/// cached-time reader here; `monotonic_ms` is the straightforward default.
pub type CurrentMsFn = fn() -> i64;

/// CLOCK_MONOTONIC in milliseconds.
pub fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// One timer tree, usually one per worker next to its reactor.
pub struct EventTimer {
    rbtree: Rbtree,
    // Boxed so the tree's sentinel pointer survives moves of the owner.
    _sentinel: Box<RbtreeNode>,
    time_handler: CurrentMsFn,
}

impl EventTimer {
    pub fn new(time_handler: CurrentMsFn) -> Self {
        let mut sentinel = Box::new(RbtreeNode::new());
        let rbtree = unsafe { Rbtree::init(&mut *sentinel, rbtree_insert_timer_value) };
        Self {
            rbtree,
            _sentinel: sentinel,
            time_handler,
        }
    }

    /// Milliseconds until the nearest deadline: 0 when already due,
    /// `TIMER_INFINITE` when no timer is set.
    pub fn find_timer(&self) -> i64 {
        if self.rbtree.is_empty() {
            return TIMER_INFINITE;
        }
        let node = self.rbtree.min();
        let timer = unsafe { (*node).key } - (self.time_handler)();
        if timer > 0 {
            timer
        } else {
            0
        }
    }

    /// Pop and dispatch every event whose deadline has passed, with
    /// `timedout` set so the handler can tell expiry from readiness.
    ///
    /// # Safety
    /// Tree nodes must be `Event::timer` fields of live events.
    pub unsafe fn expire_timers(&mut self) {
        loop {
            if self.rbtree.is_empty() {
                return;
            }
            let node = self.rbtree.min();
            if (*node).key > (self.time_handler)() {
                return;
            }
            let ev = (node as *mut u8).sub(std::mem::offset_of!(Event, timer)) as *mut Event;

            self.rbtree.delete(&mut (*ev).timer);
            (*ev).timer_set = false;
            (*ev).timedout = true;

            if let Some(handler) = (*ev).handler {
                handler(ev);
            }
        }
    }

    /// Arm (or lazily re-arm) `ev` to fire `timer_ms` from now.
    ///
    /// # Safety
    /// `ev` must stay allocated while it is on the tree.
    pub unsafe fn add_timer(&mut self, ev: *mut Event, timer_ms: i64) {
        let key = (self.time_handler)() + timer_ms;

        if (*ev).timer_set {
            // Within the lazy window the previous deadline is close
            // enough; skip the rbtree churn.
            let diff = key - (*ev).timer.key;
            if diff.abs() < TIMER_LAZY_DELAY {
                return;
            }
            self.del_timer(ev);
        }

        (*ev).timer.key = key;
        self.rbtree.insert(&mut (*ev).timer);
        log::trace!("add timer: ev {:p} key {}", ev, key);
        (*ev).timer_set = true;
    }

    /// Disarm `ev`.  A timer that is not set is left alone.
    ///
    /// # Safety
    /// `ev` must be valid.
    pub unsafe fn del_timer(&mut self, ev: *mut Event) {
        if !(*ev).timer_set {
            return;
        }
        log::trace!("delete timer: ev {:p}", ev);
        self.rbtree.delete(&mut (*ev).timer);
        (*ev).timer_set = false;
    }
}
