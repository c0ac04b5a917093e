// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Chain and chain-I/O tests: cursor arithmetic on partial writes, iovec
// packing over a real socketpair, sendfile of a file region, and the
// alternating memory/file output driver.

use std::fs;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;

use libsrv::buffer::{buffer_create, buffer_create_file, buffer_size};
use libsrv::chain::{
    chain_alloc, chain_append_all, chain_append_buffer, chain_append_with_size, chain_empty,
    chain_output, chain_size, chain_write_update, Chain, ChainOutputCtx, OutputState,
};
use libsrv::conn::{conn_free_mem, conn_get_from_mem, conn_nonblocking, Conn};
use libsrv::pool::{pool_create, pool_destroy, Pool};
use libsrv::sysio::{sysio_sendfile_chain, sysio_writev_chain};

fn socketpair() -> [libc::c_int; 2] {
    let mut fds = [-1 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    fds
}

unsafe fn mem_chain(pool: *mut Pool, parts: &[&[u8]]) -> *mut Chain {
    let mut head: *mut Chain = std::ptr::null_mut();
    for part in parts {
        let b = buffer_create(pool, part.len());
        assert!(!b.is_null());
        std::ptr::copy_nonoverlapping(part.as_ptr(), (*b).last, part.len());
        (*b).last = (*b).last.add(part.len());
        assert!(chain_append_buffer(pool, &mut head, b));
    }
    head
}

unsafe fn read_exact(fd: libc::c_int, want: usize) -> Vec<u8> {
    let mut out = vec![0u8; want];
    let mut got = 0usize;
    while got < want {
        let n = libc::read(fd, out[got..].as_mut_ptr() as *mut libc::c_void, want - got);
        assert!(n > 0, "peer read failed");
        got += n as usize;
    }
    out
}

unsafe fn writable_conn(fd: libc::c_int) -> *mut Conn {
    let c = conn_get_from_mem(fd);
    (*(*c).write).ready = true;
    c
}

#[test]
fn write_update_splits_partially_consumed_buffer() {
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let chain = mem_chain(pool, &[&[b'a'; 512], &[b'b'; 512], &[b'c'; 512]]);
        assert_eq!(chain_size(chain), 3 * 512);

        // 600 bytes consumed: the first buffer entirely, 88 of the second.
        let rest = chain_write_update(chain, 600);
        assert_eq!(rest, (*chain).next);
        assert_eq!((*(*chain).buf).pos, (*(*chain).buf).last);
        let b1 = (*rest).buf;
        assert_eq!((*b1).pos as usize - (*b1).start as usize, 88);
        assert_eq!(chain_size(rest), 3 * 512 - 600);

        // Consuming the rest drains the chain.
        let rest = chain_write_update(rest, 3 * 512 - 600);
        assert!(rest.is_null());

        pool_destroy(pool);
    }
}

#[test]
fn append_with_size_spills_the_tail() {
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let src = mem_chain(pool, &[&[b'x'; 100], &[b'y'; 100], &[b'z'; 100]]);
        let mut dst: *mut Chain = std::ptr::null_mut();
        let mut spill: *mut Chain = std::ptr::null_mut();

        chain_append_with_size(&mut dst, src, 150, &mut spill);
        // Two nodes cover 150 bytes; the third spills.
        assert_eq!(chain_size(dst), 200);
        assert_eq!(chain_size(spill), 100);
        assert!(!chain_empty(dst));

        pool_destroy(pool);
    }
}

#[test]
fn append_all_links_chains() {
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let mut dst = mem_chain(pool, &[b"one"]);
        let more = mem_chain(pool, &[b"two", b"three"]);
        chain_append_all(&mut dst, more);
        assert_eq!(chain_size(dst), 3 + 3 + 5);

        let empty = chain_alloc(pool);
        (*empty).buf = buffer_create(pool, 16);
        assert!(chain_empty(empty));

        pool_destroy(pool);
    }
}

#[test]
fn writev_chain_sends_everything() {
    let fds = socketpair();
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let c = writable_conn(fds[0]);
        let chain = mem_chain(pool, &[b"hello ", b"vectored ", b"world"]);

        let rest = sysio_writev_chain(c, chain, 0).expect("writev");
        assert!(rest.is_null());
        assert_eq!((*c).sent, 20);

        let got = read_exact(fds[1], 20);
        assert_eq!(&got, b"hello vectored world");

        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
        pool_destroy(pool);
    }
}

#[test]
fn writev_chain_respects_limit() {
    let fds = socketpair();
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let c = writable_conn(fds[0]);
        let chain = mem_chain(pool, &[&[b'p'; 300], &[b'q'; 300]]);

        // Limit cuts the pass short; the returned head resumes later.
        let rest = sysio_writev_chain(c, chain, 400).expect("writev");
        assert!(!rest.is_null());
        assert_eq!((*c).sent, 400);
        assert_eq!(chain_size(rest), 200);

        let rest = sysio_writev_chain(c, rest, 0).expect("writev rest");
        assert!(rest.is_null());
        assert_eq!((*c).sent, 600);

        let got = read_exact(fds[1], 600);
        assert!(got[..300].iter().all(|&b| b == b'p'));
        assert!(got[300..].iter().all(|&b| b == b'q'));

        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
        pool_destroy(pool);
    }
}

#[test]
fn writev_chain_reports_again_on_full_socket() {
    let fds = socketpair();
    let pool = pool_create(8192).expect("pool");
    unsafe {
        conn_nonblocking(fds[0]).expect("nonblocking");
        // Shrink the send buffer so the chain cannot fit at once.
        let sz: libc::c_int = 4096;
        libc::setsockopt(
            fds[0],
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &sz as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let c = writable_conn(fds[0]);
        let chain = mem_chain(pool, &[&[b'm'; 1 << 20]]);

        let rest = sysio_writev_chain(c, chain, 0).expect("writev");
        // The socket filled up: some bytes went out, the head came back
        // and write-ready was cleared.
        assert!(!rest.is_null());
        assert!((*c).sent > 0);
        assert!((*c).sent < 1 << 20);
        assert!(!(*(*c).write).ready);

        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
        pool_destroy(pool);
    }
}

#[test]
fn sendfile_chain_pushes_file_regions() {
    let path = format!("/tmp/libsrv_sendfile_{}", std::process::id());
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    {
        let mut f = fs::File::create(&path).expect("create file");
        f.write_all(&payload).expect("fill file");
    }
    let file = fs::File::open(&path).expect("open file");

    let fds = socketpair();
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let c = writable_conn(fds[0]);

        let b = buffer_create_file(pool, 0, payload.len() as i64);
        let mut chain: *mut Chain = std::ptr::null_mut();
        assert!(chain_append_buffer(pool, &mut chain, b));

        let rest = sysio_sendfile_chain(c, chain, file.as_raw_fd(), 0).expect("sendfile");
        assert!(rest.is_null());
        assert_eq!((*c).sent, payload.len());
        assert_eq!(buffer_size(b), 0);

        let got = read_exact(fds[1], payload.len());
        assert_eq!(got, payload);

        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
        pool_destroy(pool);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn chain_output_alternates_memory_and_file() {
    let path = format!("/tmp/libsrv_chain_output_{}", std::process::id());
    {
        let mut f = fs::File::create(&path).expect("create file");
        f.write_all(b"FILEDATA").expect("fill file");
    }
    let file = fs::File::open(&path).expect("open file");

    let fds = socketpair();
    let pool = pool_create(8192).expect("pool");
    unsafe {
        let c = writable_conn(fds[0]);
        (*c).send_chain = Some(sysio_writev_chain);
        (*c).sendfile_chain = Some(sysio_sendfile_chain);

        let mut head = mem_chain(pool, &[b"head:"]);
        let fb = buffer_create_file(pool, 0, 8);
        assert!(chain_append_buffer(pool, &mut head, fb));
        let tail = mem_chain(pool, &[b":tail"]);
        chain_append_all(&mut head, tail);

        let mut ctx = ChainOutputCtx {
            out: std::ptr::null_mut(),
            connection: c,
            fd: file.as_raw_fd(),
            limit: 0,
        };
        let state = chain_output(&mut ctx, head).expect("chain_output");
        assert_eq!(state, OutputState::Done);
        assert_eq!((*c).sent, 5 + 8 + 5);

        let got = read_exact(fds[1], 18);
        assert_eq!(&got, b"head:FILEDATA:tail");

        libc::close(fds[0]);
        libc::close(fds[1]);
        conn_free_mem(c);
        pool_destroy(pool);
    }
    let _ = fs::remove_file(&path);
}
