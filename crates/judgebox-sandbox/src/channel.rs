//! Handshake channel between the spawning parent and its forked child.
//!
//! A `SOCK_DGRAM` socketpair carries the four-phase provisioning protocol:
//! the parent sends one `GO_*` byte per phase, the child answers [`msg::OK`]
//! or [`msg::FAIL`] after performing it. Both ends are `SOCK_CLOEXEC`, so a
//! successful `execve` closes the child's copy without any farewell byte.
//!
//! Datagram sockets never signal end-of-stream, so a child that dies
//! without replying would leave the parent blocked forever. Every parent
//! receive is therefore bounded: no reply within [`REPLY_TIMEOUT_MS`]
//! reads as [`Reply::Gone`] and the parent tears the spawn down.
//!
//! ## Fd hygiene
//!
//! After fork each side must close the peer's end:
//! - parent keeps `parent`, closes `child` (via [`Channel::into_parent`])
//! - child keeps `child`, closes its inherited copy of `parent`

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use rustix::io::Errno;

use judgebox_sys::socket;

/// How long the parent waits for a step verdict before declaring the
/// child gone. Provisioning steps are a handful of syscalls; seconds of
/// silence mean the child is dead or wedged.
const REPLY_TIMEOUT_MS: i32 = 30_000;

/// Protocol bytes. One datagram each; values chosen so that no `GO_*`
/// collides with a reply.
pub(crate) mod msg {
    /// Step completed.
    pub const OK: u8 = 0x01;
    /// Step failed; the child exits right after sending this.
    pub const FAIL: u8 = 0xff;

    /// Apply bind mounts (pre-chroot).
    pub const GO_BINDFS: u8 = 0x11;
    /// Chroot and chdir to the new root.
    pub const GO_CHROOT: u8 = 0x12;
    /// Apply tmpfs mounts (post-chroot).
    pub const GO_TMPFS: u8 = 0x13;
    /// Drop credentials, apply nice and rlimits.
    pub const GO_CREDS: u8 = 0x14;
    /// Final release: reset signals and exec.
    pub const GO_EXEC: u8 = 0x15;
}

/// What the parent learned from one child reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Ok,
    Fail,
    /// No reply within the timeout - the child died mid-step.
    Gone,
}

/// Both ends of the handshake socketpair, pre-fork.
#[derive(Debug)]
pub(crate) struct Channel {
    parent: OwnedFd,
    child: OwnedFd,
}

impl Channel {
    pub fn new() -> io::Result<Self> {
        let (parent, child) = socket::datagram_pair()?;
        Ok(Self { parent, child })
    }

    /// Fd the child end lives on; handed to the child context before fork.
    #[inline]
    pub fn child_fd(&self) -> RawFd {
        self.child.as_raw_fd()
    }

    /// Fd the parent end lives on; the child closes its inherited copy.
    #[inline]
    pub fn parent_fd(&self) -> RawFd {
        self.parent.as_raw_fd()
    }

    /// Post-fork parent side: drop the child end, keep ours.
    pub fn into_parent(self) -> ParentEnd {
        ParentEnd { fd: self.parent }
    }
}

/// The parent's side of the handshake after fork.
#[derive(Debug)]
pub(crate) struct ParentEnd {
    fd: OwnedFd,
}

impl ParentEnd {
    /// Release the child into its next provisioning step.
    pub fn send_go(&self, go: u8) -> Result<(), Errno> {
        socket::send_byte(self.fd.as_raw_fd(), go)
    }

    /// Wait for the child's verdict on the step just released.
    pub fn recv_reply(&self) -> Result<Reply, Errno> {
        self.recv_reply_within(REPLY_TIMEOUT_MS)
    }

    fn recv_reply_within(&self, timeout_ms: i32) -> Result<Reply, Errno> {
        if !socket::wait_readable(self.fd.as_raw_fd(), timeout_ms)? {
            return Ok(Reply::Gone);
        }
        match socket::recv_byte(self.fd.as_raw_fd())? {
            msg::OK => Ok(Reply::Ok),
            _ => Ok(Reply::Fail),
        }
    }

    /// Swallow whatever the dying child still queued, so teardown never
    /// mistakes a stale byte for a fresh reply.
    pub fn drain(&self) {
        socket::drain(self.fd.as_raw_fd());
    }
}

/// Child side: wait for a specific `GO_*`. Anything else means the spawn
/// is being torn down. Bounded for the same reason as the parent side: a
/// parent that dies before releasing the child must not leave an orphan
/// blocked on the socket.
///
/// Only raw syscalls; callable between fork and exec.
pub(crate) fn child_await(fd: RawFd, expected: u8) -> bool {
    match socket::wait_readable(fd, REPLY_TIMEOUT_MS) {
        Ok(true) => matches!(socket::recv_byte(fd), Ok(byte) if byte == expected),
        _ => false,
    }
}

/// Child side: report the step's verdict.
pub(crate) fn child_reply(fd: RawFd, ok: bool) {
    let byte = if ok { msg::OK } else { msg::FAIL };
    // A send failure means the parent is gone; the caller exits either way.
    let _ = socket::send_byte(fd, byte);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `into_parent` drops the parent process's own copy of the child fd,
    /// exactly as it would after a real `fork()` — the actual child
    /// process keeps its own duplicate from the fork and is unaffected.
    /// These single-process tests stand in for that child process, so
    /// they must hold their own duplicate too, the same way fork would
    /// have given them one.
    fn dup_fd(fd: RawFd) -> RawFd {
        // SAFETY: fd is a valid, open descriptor owned by the test's `Channel`.
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0, "dup failed");
        dup
    }

    #[test]
    fn reply_roundtrip() {
        let chan = Channel::new().unwrap();
        let child_fd = dup_fd(chan.child_fd());
        let parent = chan.into_parent();

        parent.send_go(msg::GO_BINDFS).unwrap();
        assert!(child_await(child_fd, msg::GO_BINDFS));

        child_reply(child_fd, true);
        assert_eq!(parent.recv_reply().unwrap(), Reply::Ok);

        child_reply(child_fd, false);
        assert_eq!(parent.recv_reply().unwrap(), Reply::Fail);

        unsafe { libc::close(child_fd) };
    }

    #[test]
    fn unexpected_go_is_rejected() {
        let chan = Channel::new().unwrap();
        let child_fd = dup_fd(chan.child_fd());
        let parent = chan.into_parent();

        parent.send_go(msg::GO_EXEC).unwrap();
        assert!(!child_await(child_fd, msg::GO_BINDFS));

        unsafe { libc::close(child_fd) };
    }

    #[test]
    fn silent_child_reads_as_gone() {
        let chan = Channel::new().unwrap();
        let parent = chan.into_parent(); // child end dropped, nothing will reply
        assert_eq!(parent.recv_reply_within(20).unwrap(), Reply::Gone);
    }

    #[test]
    fn go_bytes_never_collide_with_replies() {
        for go in [
            msg::GO_BINDFS,
            msg::GO_CHROOT,
            msg::GO_TMPFS,
            msg::GO_CREDS,
            msg::GO_EXEC,
        ] {
            assert_ne!(go, msg::OK);
            assert_ne!(go, msg::FAIL);
        }
    }
}
