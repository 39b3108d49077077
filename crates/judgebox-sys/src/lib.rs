//! Low-level Linux syscall wrappers for the judgebox sandbox.
//!
//! This crate provides thin wrappers around the Linux-specific syscalls the
//! sandbox core needs and that are awkward to call directly through libc from
//! async-signal-safe contexts. For standard file operations, use `std::fs`.
//!
//! ## Modules
//!
//! - **mount** - mount(2)/umount2(2) with pre-assembled `MS_*` flag sets
//! - **socket** - `AF_UNIX SOCK_DGRAM` socketpair and single-byte messaging
//! - **signal** - signal disposition and mask reset between fork and exec
//!
//! ## Fork safety
//!
//! Everything in `mount`, `socket` and `signal` that takes `&CStr` or a raw
//! fd performs exactly one syscall and no allocation, so it is safe to call
//! in a child between `clone(2)` and `execve(2)`. Callers prepare all
//! `CString`s before forking.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod mount;
pub mod signal;
pub mod socket;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
