// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel transport tests: the fixed command struct crosses a
// socketpair, and OPEN carries a live descriptor via SCM_RIGHTS.

use libsrv::channel::{
    channel_close, channel_pair, channel_read, channel_write, ChannelError, ChannelMsg,
    CHANNEL_CMD_OPEN, CHANNEL_CMD_QUIT,
};

#[test]
fn plain_command_round_trip() {
    let mut fds = channel_pair().expect("socketpair");

    let mut msg = ChannelMsg::new(CHANNEL_CMD_QUIT);
    msg.slot = 7;
    channel_write(fds[0], &msg).expect("write");

    let mut got = ChannelMsg::new(0);
    let n = channel_read(fds[1], &mut got).expect("read");
    assert_eq!(n, std::mem::size_of::<ChannelMsg>());
    assert_eq!(got.command, CHANNEL_CMD_QUIT);
    assert_eq!(got.slot, 7);
    assert_eq!(got.pid, msg.pid);
    // No ancillary data travels outside OPEN.
    assert_eq!(got.fd, -1);

    channel_close(&mut fds);
}

#[test]
fn open_passes_a_descriptor() {
    let mut fds = channel_pair().expect("socketpair");

    // Ship the read end of a pipe to the "other worker".
    let mut pipe_fds = [-1 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);

    let mut msg = ChannelMsg::new(CHANNEL_CMD_OPEN);
    msg.fd = pipe_fds[0];
    msg.slot = 1;
    channel_write(fds[0], &msg).expect("write");

    let mut got = ChannelMsg::new(0);
    channel_read(fds[1], &mut got).expect("read");
    assert_eq!(got.command, CHANNEL_CMD_OPEN);
    // The received descriptor is a new fd for the same pipe.
    assert_ne!(got.fd, -1);
    assert_ne!(got.fd, pipe_fds[0]);

    unsafe {
        let n = libc::write(pipe_fds[1], b"fd ok".as_ptr() as *const libc::c_void, 5);
        assert_eq!(n, 5);
        let mut buf = [0u8; 8];
        let n = libc::read(got.fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"fd ok");

        libc::close(got.fd);
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }
    channel_close(&mut fds);
}

#[test]
fn closed_peer_is_reported() {
    let fds = channel_pair().expect("socketpair");
    unsafe { libc::close(fds[0]) };

    let mut got = ChannelMsg::new(0);
    assert!(matches!(
        channel_read(fds[1], &mut got),
        Err(ChannelError::Closed)
    ));
    unsafe { libc::close(fds[1]) };
}

#[test]
fn nonblocking_empty_read_is_again() {
    let mut fds = channel_pair().expect("socketpair");
    unsafe {
        let flags = libc::fcntl(fds[1], libc::F_GETFL);
        libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    let mut got = ChannelMsg::new(0);
    assert!(matches!(
        channel_read(fds[1], &mut got),
        Err(ChannelError::Again)
    ));
    channel_close(&mut fds);
}
