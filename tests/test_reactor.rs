// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Reactor tests over real socketpairs: inline dispatch, posted-event
// queues, stale-event suppression via instance parity, and the
// close-flag delete path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libsrv::conn::{conn_close, conn_free_mem, conn_get_from_mem, conn_set_default, Conn};
use libsrv::epoll::{EventBase, EVENT_CLOSE_EVENT, EVENT_POST_EVENTS, EVENT_READ};
use libsrv::event::{event_process_posted, Event};

fn socketpair() -> [libc::c_int; 2] {
    let mut fds = [-1 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    fds
}

fn poke(fd: libc::c_int) {
    let n = unsafe { libc::write(fd, b"!".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
}

static READS: AtomicUsize = AtomicUsize::new(0);

fn counting_read_handler(ev: *mut Event) {
    unsafe {
        let c = (*ev).data as *mut Conn;
        let mut buf = [0u8; 16];
        libc::read((*c).fd, buf.as_mut_ptr() as *mut libc::c_void, 16);
    }
    READS.fetch_add(1, Ordering::Relaxed);
}

// The reactor tests share handler counters; run them under one lock so
// parallel test threads cannot interleave.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn inline_dispatch() {
    let _guard = SERIAL.lock().unwrap();
    READS.store(0, Ordering::Relaxed);

    let mut base = EventBase::init(32).expect("epoll init");
    let fds = socketpair();
    unsafe {
        let c = conn_get_from_mem(fds[0]);
        (*c).ev_base = &mut base;
        (*(*c).read).handler = Some(counting_read_handler);
        base.add_event((*c).read, EVENT_READ, 0).expect("add");

        poke(fds[1]);
        base.process_events(500, 0).expect("process");
        assert_eq!(READS.load(Ordering::Relaxed), 1);

        // Nothing pending: the wait times out quietly.
        base.process_events(10, 0).expect("process idle");
        assert_eq!(READS.load(Ordering::Relaxed), 1);

        base.del_event((*c).read, EVENT_READ, 0).expect("del");
        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
    }
}

#[test]
fn posted_events_are_deferred_and_drained() {
    let _guard = SERIAL.lock().unwrap();
    READS.store(0, Ordering::Relaxed);

    let mut base = EventBase::init(32).expect("epoll init");
    let fds = socketpair();
    unsafe {
        let c = conn_get_from_mem(fds[0]);
        (*c).ev_base = &mut base;
        (*(*c).read).handler = Some(counting_read_handler);
        base.add_event((*c).read, EVENT_READ, 0).expect("add");

        poke(fds[1]);
        base.process_events(500, EVENT_POST_EVENTS).expect("process");
        // Deferred: nothing ran yet.
        assert_eq!(READS.load(Ordering::Relaxed), 0);

        event_process_posted(base.posted_events());
        assert_eq!(READS.load(Ordering::Relaxed), 1);

        base.del_event((*c).read, EVENT_READ, 0).expect("del");
        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
    }
}

#[test]
fn accepted_events_post_to_their_own_queue() {
    let _guard = SERIAL.lock().unwrap();
    READS.store(0, Ordering::Relaxed);

    let mut base = EventBase::init(32).expect("epoll init");
    let fds = socketpair();
    unsafe {
        let c = conn_get_from_mem(fds[0]);
        (*c).ev_base = &mut base;
        (*(*c).read).handler = Some(counting_read_handler);
        (*(*c).read).accepted = true;
        base.add_event((*c).read, EVENT_READ, 0).expect("add");

        poke(fds[1]);
        base.process_events(500, EVENT_POST_EVENTS).expect("process");
        assert_eq!(READS.load(Ordering::Relaxed), 0);

        // The ordinary queue is empty; the accept queue has the event.
        event_process_posted(base.posted_events());
        assert_eq!(READS.load(Ordering::Relaxed), 0);
        event_process_posted(base.posted_accept_events());
        assert_eq!(READS.load(Ordering::Relaxed), 1);

        base.del_event((*c).read, EVENT_READ, 0).expect("del");
        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
    }
}

// Two ready connections in one batch; each handler closes and re-arms
// the other.  Whichever dispatches first invalidates the second entry,
// whose parity no longer matches, so exactly one handler runs.
static PEERS: Mutex<(usize, usize, libc::c_int, libc::c_int)> = Mutex::new((0, 0, -1, -1));

fn closing_read_handler(ev: *mut Event) {
    unsafe {
        let c = (*ev).data as *mut Conn;
        let mut buf = [0u8; 16];
        libc::read((*c).fd, buf.as_mut_ptr() as *mut libc::c_void, 16);

        let peers = PEERS.lock().unwrap();
        let (c1, c2, spare1, spare2) = *peers;
        let (other, spare) = if c as usize == c1 {
            (c2 as *mut Conn, spare1)
        } else {
            (c1 as *mut Conn, spare2)
        };
        // Close the sibling and hand its record a new life: the parity
        // flip is what marks the batched kernel entry stale.
        conn_close(other);
        conn_set_default(other, spare);
    }
    READS.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn stale_events_from_the_same_batch_are_dropped() {
    let _guard = SERIAL.lock().unwrap();
    READS.store(0, Ordering::Relaxed);

    let mut base = EventBase::init(32).expect("epoll init");
    let pair_a = socketpair();
    let pair_b = socketpair();
    let spares = socketpair();
    unsafe {
        let c1 = conn_get_from_mem(pair_a[0]);
        let c2 = conn_get_from_mem(pair_b[0]);
        for &c in [c1, c2].iter() {
            (*c).ev_base = &mut base;
            (*(*c).read).handler = Some(closing_read_handler);
        }
        *PEERS.lock().unwrap() = (c1 as usize, c2 as usize, spares[0], spares[1]);

        base.add_event((*c1).read, EVENT_READ, 0).expect("add c1");
        base.add_event((*c2).read, EVENT_READ, 0).expect("add c2");

        // Both become readable before the wait, so both entries land in
        // the same report batch.
        poke(pair_a[1]);
        poke(pair_b[1]);
        base.process_events(500, 0).expect("process");

        assert_eq!(READS.load(Ordering::Relaxed), 1);

        libc::close(pair_a[0]);
        libc::close(pair_a[1]);
        libc::close(pair_b[0]);
        libc::close(pair_b[1]);
        libc::close(spares[0]);
        libc::close(spares[1]);
        conn_free_mem(c1);
        conn_free_mem(c2);
    }
}

#[test]
fn close_flag_delete_skips_the_kernel() {
    let _guard = SERIAL.lock().unwrap();

    let mut base = EventBase::init(32).expect("epoll init");
    let fds = socketpair();
    unsafe {
        let c = conn_get_from_mem(fds[0]);
        (*c).ev_base = &mut base;
        (*(*c).read).handler = Some(counting_read_handler);
        base.add_event((*c).read, EVENT_READ, 0).expect("add");

        // The fd is gone; the kernel dropped the entry on its own, and
        // the close-flag delete is a flag-only operation, idempotent.
        libc::close(fds[0]);
        (*c).fd = -1;
        base.del_event((*c).read, EVENT_READ, EVENT_CLOSE_EVENT)
            .expect("del close 1");
        assert!(!(*(*c).read).active);
        base.del_event((*c).read, EVENT_READ, EVENT_CLOSE_EVENT)
            .expect("del close 2");

        libc::close(fds[1]);
        conn_free_mem(c);
    }
}
