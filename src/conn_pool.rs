// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection pool: `N` pre-allocated connection records with `2N` event
// records, threaded as a LIFO free list.  A worker whose quota moved
// (`change_n`) borrows missing records from the process-wide reservoir
// and donates surplus back; the reservoir is guarded by one spin lock.

use std::cell::UnsafeCell;
use std::ptr;

use crate::atomic_lock::AtomicLock;
use crate::conn::{Conn, INVALID_FD};
use crate::event::Event;

/// Per-worker pool.  The backing arrays are owned; records are recycled
/// in place and never freed individually, which is what lets stale
/// kernel notifications be detected instead of faulting.
pub struct ConnPool {
    connections: Vec<Conn>,
    read_events: Vec<Event>,
    write_events: Vec<Event>,
    free_connections: *mut Conn,
    free_connection_n: u32,
    used_n: u32,
    /// Negative: this pool is short and may borrow.  Positive: over
    /// quota, releases donate to the reservoir.  Zero: balanced.
    change_n: i32,
}

unsafe impl Send for ConnPool {}

impl ConnPool {
    /// Pre-allocate `connection_n` records and link them LIFO.
    pub fn init(connection_n: u32) -> Option<ConnPool> {
        if connection_n == 0 {
            return None;
        }
        let n = connection_n as usize;
        let mut connections: Vec<Conn> = (0..n).map(|_| Conn::default()).collect();
        let mut read_events: Vec<Event> = (0..n).map(|_| Event::new()).collect();
        let mut write_events: Vec<Event> = (0..n).map(|_| Event::new()).collect();

        let conn = connections.as_mut_ptr();
        let revs = read_events.as_mut_ptr();
        let wevs = write_events.as_mut_ptr();
        unsafe {
            for i in 0..n {
                (*revs.add(i)).instance = 1;

                (*conn.add(i)).next = if i == n - 1 {
                    ptr::null_mut()
                } else {
                    conn.add(i + 1)
                };
                (*conn.add(i)).fd = INVALID_FD;
                (*conn.add(i)).read = revs.add(i);
                (*conn.add(i)).write = wevs.add(i);
                (*revs.add(i)).timer_event = false;
                (*wevs.add(i)).timer_event = false;
            }
        }

        let free_connections = conn;
        Some(ConnPool {
            connections,
            read_events,
            write_events,
            free_connections,
            free_connection_n: connection_n,
            used_n: 0,
            change_n: 0,
        })
    }

    pub fn connection_n(&self) -> u32 {
        self.connections.len() as u32
    }

    pub fn free_connection_n(&self) -> u32 {
        self.free_connection_n
    }

    pub fn used_n(&self) -> u32 {
        self.used_n
    }

    pub fn change_n(&self) -> i32 {
        self.change_n
    }

    /// Pop a record.  An empty pool that is short (`change_n < 0`)
    /// borrows up to the shortfall from the reservoir; a balanced pool
    /// that runs empty simply fails.
    pub fn get_connection(&mut self) -> *mut Conn {
        let mut c = self.free_connections;
        if c.is_null() {
            if self.change_n >= 0 {
                return ptr::null_mut();
            }
            let want = (-self.change_n) as u32;
            let (head, num) = comm_conn_get(want);
            if head.is_null() {
                return ptr::null_mut();
            }
            self.free_connections = head;
            self.free_connection_n += num;
            self.change_n += num as i32;
            c = head;
        }

        unsafe {
            self.free_connections = (*c).next;
        }
        self.free_connection_n -= 1;
        self.used_n += 1;
        c
    }

    /// Push a record back; an over-quota pool donates it to the
    /// reservoir instead.
    ///
    /// # Safety
    /// `c` must have come from this pool or the reservoir.
    pub unsafe fn free_connection(&mut self, c: *mut Conn) {
        if self.change_n > 0 {
            self.used_n -= 1;
            comm_conn_put(c);
            self.change_n -= 1;
            return;
        }
        (*c).next = self.free_connections;
        self.free_connections = c;
        self.free_connection_n += 1;
        self.used_n -= 1;
    }

    /// Lower this pool's quota by `n` records (they are now owed to the
    /// reservoir).
    pub fn conn_pool_out(&mut self, n: i32) {
        self.change_n -= n;
        self.used_n = (self.used_n as i64 - n as i64) as u32;
    }

    /// Raise this pool's quota by `n` records.
    pub fn conn_pool_in(&mut self, n: i32) {
        self.change_n += n;
        self.used_n = (self.used_n as i64 + n as i64) as u32;
    }
}

struct CommConnPool {
    free_connections: *mut Conn,
    free_connection_n: u32,
}

struct CommCell(UnsafeCell<CommConnPool>);

// Guarded by COMM_CONN_LOCK.
unsafe impl Sync for CommCell {}

static COMM_CONN_LOCK: AtomicLock = AtomicLock::new();
static COMM_CONN_POOL: CommCell = CommCell(UnsafeCell::new(CommConnPool {
    free_connections: ptr::null_mut(),
    free_connection_n: 0,
}));

/// Reset the process-wide reservoir.  Call once before workers start.
pub fn conn_pool_common_init() {
    COMM_CONN_LOCK.reset();
    unsafe {
        let comm = &mut *COMM_CONN_POOL.0.get();
        comm.free_connections = ptr::null_mut();
        comm.free_connection_n = 0;
    }
}

/// Drop the reservoir's links.  The records themselves belong to the
/// worker pools that donated them.
pub fn conn_pool_common_release() {
    COMM_CONN_LOCK.reset();
    unsafe {
        let comm = &mut *COMM_CONN_POOL.0.get();
        comm.free_connections = ptr::null_mut();
        comm.free_connection_n = 0;
    }
}

/// Records currently parked in the reservoir.
pub fn comm_conn_count() -> u32 {
    COMM_CONN_LOCK.on();
    let n = unsafe { (*COMM_CONN_POOL.0.get()).free_connection_n };
    COMM_CONN_LOCK.off();
    n
}

fn comm_conn_put(c: *mut Conn) {
    COMM_CONN_LOCK.on();
    unsafe {
        let comm = &mut *COMM_CONN_POOL.0.get();
        comm.free_connection_n += 1;
        (*c).next = comm.free_connections;
        comm.free_connections = c;
    }
    COMM_CONN_LOCK.off();
}

/// Detach up to `n` records from the reservoir; returns the head and the
/// count actually taken.
fn comm_conn_get(n: u32) -> (*mut Conn, u32) {
    COMM_CONN_LOCK.on();
    unsafe {
        let comm = &mut *COMM_CONN_POOL.0.get();

        if comm.free_connection_n == 0 {
            COMM_CONN_LOCK.off();
            return (ptr::null_mut(), 0);
        }

        if n >= comm.free_connection_n {
            let c = comm.free_connections;
            let num = comm.free_connection_n;
            comm.free_connections = ptr::null_mut();
            comm.free_connection_n = 0;
            COMM_CONN_LOCK.off();
            return (c, num);
        }

        // Detach the first n records.
        let head = comm.free_connections;
        let mut plast = head;
        let mut p = head;
        let mut i = n;
        while !p.is_null() && i > 0 {
            plast = p;
            p = (*p).next;
            i -= 1;
        }
        comm.free_connections = p;
        comm.free_connection_n -= n;
        (*plast).next = ptr::null_mut();

        COMM_CONN_LOCK.off();
        (head, n)
    }
}
