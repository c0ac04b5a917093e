// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Listening socket tests: open with the configured socket options,
// accept readiness through the reactor, and clean close.

use std::sync::atomic::{AtomicUsize, Ordering};

use libsrv::conn::Conn;
use libsrv::epoll::EventBase;
use libsrv::event::Event;
use libsrv::listen::{
    conn_listening_add, conn_listening_add_event, conn_listening_close, conn_listening_open,
    ListenConfig,
};

static ACCEPTS: AtomicUsize = AtomicUsize::new(0);

fn accept_handler(ev: *mut Event) {
    unsafe {
        let c = (*ev).data as *mut Conn;
        let fd = libc::accept((*c).fd, std::ptr::null_mut(), std::ptr::null_mut());
        if fd != -1 {
            libc::close(fd);
        }
    }
    ACCEPTS.fetch_add(1, Ordering::Relaxed);
}

fn test_port(salt: u16) -> u16 {
    // Spread across a high range to dodge other test runs on the host.
    40000 + ((std::process::id() as u16).wrapping_mul(31).wrapping_add(salt) % 20000)
}

fn connect_localhost(port: u16) -> libc::c_int {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert_ne!(fd, -1);
        let mut sin: libc::sockaddr_in = std::mem::zeroed();
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        sin.sin_port = port.to_be();
        let rc = libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "connect to test listener failed");
        fd
    }
}

#[test]
fn add_rejects_port_zero() {
    let cfg = ListenConfig::default();
    let mut set = Vec::new();
    assert!(conn_listening_add(&mut set, &cfg, 0, 0, accept_handler, -1, -1).is_none());
}

#[test]
fn add_clamps_buffer_sizes() {
    let cfg = ListenConfig::default();
    let mut set = Vec::new();
    let ls = conn_listening_add(
        &mut set,
        &cfg,
        u32::from(std::net::Ipv4Addr::LOCALHOST),
        test_port(1),
        accept_handler,
        1024,
        1 << 20,
    )
    .expect("add listener");
    // Small requests are raised to the configured minimum, big ones kept.
    assert_eq!(ls.rcvbuf, cfg.rcvbuf);
    assert_eq!(ls.sndbuf, 1 << 20);
    assert!(ls.addr_text.starts_with("127.0.0.1:"));
}

#[test]
fn open_accept_close() {
    ACCEPTS.store(0, Ordering::Relaxed);

    let cfg = ListenConfig::default();
    let port = test_port(2);
    let mut set = Vec::new();
    conn_listening_add(
        &mut set,
        &cfg,
        u32::from(std::net::Ipv4Addr::LOCALHOST),
        port,
        accept_handler,
        -1,
        -1,
    )
    .expect("add listener");

    conn_listening_open(&mut set, &cfg).expect("open listener");
    assert!(set[0].open);
    assert!(set[0].fd >= 0);

    let mut base = EventBase::init(16).expect("epoll init");
    conn_listening_add_event(&mut base, &mut set).expect("register listener");

    let client = connect_localhost(port);
    unsafe { base.process_events(2000, 0).expect("process") };
    assert_eq!(ACCEPTS.load(Ordering::Relaxed), 1);

    unsafe { libc::close(client) };
    conn_listening_close(&mut set);
    assert_eq!(set[0].fd, -1);
}
