//! `AF_UNIX SOCK_DGRAM` socketpair and single-byte messaging.
//!
//! The spawn handshake exchanges one-byte datagrams between parent and
//! child. A datagram pair keeps message boundaries intact, and
//! `SOCK_CLOEXEC` on both ends makes the child's copy vanish at exec.
//!
//! Datagram sockets have no end-of-stream: a peer that dies without
//! sending leaves the reader blocked. Callers that must survive a silent
//! peer death bound the wait with [`wait_readable`] before receiving.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use rustix::io::Errno;

use crate::last_errno;

/// Create an `AF_UNIX SOCK_DGRAM` socketpair with `SOCK_CLOEXEC` on both
/// ends.
///
/// Returns `(parent_end, child_end)`. After fork, the parent closes
/// `child_end` and the child closes `parent_end`.
pub fn datagram_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: socketpair writes two fds into the valid array on success.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success both fds are valid and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send one byte. Blocks until the datagram is queued.
pub fn send_byte(fd: RawFd, byte: u8) -> Result<(), Errno> {
    loop {
        // SAFETY: byte is a valid one-byte buffer for the duration of the call.
        let ret = unsafe { libc::send(fd, (&byte as *const u8).cast(), 1, 0) };
        if ret == 1 {
            return Ok(());
        }
        let err = last_errno();
        if err != Errno::INTR {
            return Err(err);
        }
    }
}

/// Receive one byte, blocking until a datagram arrives.
pub fn recv_byte(fd: RawFd) -> Result<u8, Errno> {
    let mut byte = 0u8;
    loop {
        // SAFETY: byte is a valid one-byte buffer for the duration of the call.
        let ret = unsafe { libc::recv(fd, (&mut byte as *mut u8).cast(), 1, 0) };
        match ret {
            1 => return Ok(byte),
            // Zero-length datagram; the protocol never sends one.
            0 => continue,
            _ => {
                let err = last_errno();
                if err != Errno::INTR {
                    return Err(err);
                }
            }
        }
    }
}

/// Wait up to `timeout_ms` for `fd` to become readable. `Ok(false)` means
/// the wait timed out with nothing to read.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<bool, Errno> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a valid pollfd array of length 1.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ret {
            0 => return Ok(false),
            r if r > 0 => return Ok(true),
            _ => {
                let err = last_errno();
                if err != Errno::INTR {
                    return Err(err);
                }
            }
        }
    }
}

/// Drain any bytes still queued on `fd` without blocking. Used by the
/// parent when tearing down a failed spawn.
pub fn drain(fd: RawFd) {
    let mut byte = 0u8;
    loop {
        // SAFETY: byte is a valid one-byte buffer for the duration of the call.
        let ret = unsafe { libc::recv(fd, (&mut byte as *mut u8).cast(), 1, libc::MSG_DONTWAIT) };
        if ret != 1 {
            break;
        }
    }
}
