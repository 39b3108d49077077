//! mount(2) and umount2(2) wrappers.
//!
//! Each function issues exactly one syscall with a fixed flag set and takes
//! pre-built `&CStr` paths, so all of them may be called by a forked child
//! before exec. Flag choices:
//!
//! | operation | flags |
//! |-----------|-------|
//! | `bind` | `MS_BIND \| MS_NOSUID` |
//! | `remount_readonly` | `MS_BIND \| MS_REMOUNT \| MS_RDONLY \| MS_NOSUID` |
//! | `tmpfs` | `MS_NOSUID`, data carries `size=` and `mode=` |
//! | `cgroup` | none, data carries the controller list |
//! | `umount` | `MNT_DETACH` when lazy |

use std::ffi::CStr;

use rustix::io::Errno;

use crate::last_errno;

/// Bind `src` onto `dest`. The mount starts read-write; follow up with
/// [`remount_readonly`] to lock it down.
pub fn bind(src: &CStr, dest: &CStr) -> Result<(), Errno> {
    // SAFETY: all pointers come from valid CStrs, fstype/data unused for binds.
    let ret = unsafe {
        libc::mount(
            src.as_ptr(),
            dest.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_NOSUID,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Remount an existing bind mount read-only.
pub fn remount_readonly(dest: &CStr) -> Result<(), Errno> {
    // SAFETY: dest is a valid CStr; source/fstype are ignored on remount.
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            dest.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Mount a tmpfs at `dest`. `data` carries the `size=<bytes>,mode=<octal>`
/// option string, prepared by the caller.
pub fn tmpfs(dest: &CStr, data: &CStr) -> Result<(), Errno> {
    // SAFETY: pointers come from valid CStrs.
    let ret = unsafe {
        libc::mount(
            c"tmpfs".as_ptr(),
            dest.as_ptr(),
            c"tmpfs".as_ptr(),
            libc::MS_NOSUID,
            data.as_ptr().cast(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Mount a cgroup v1 hierarchy at `dest` with the given comma-separated
/// controller list (e.g. `memory,cpuacct,devices`).
pub fn cgroup(dest: &CStr, controllers: &CStr) -> Result<(), Errno> {
    // SAFETY: pointers come from valid CStrs.
    let ret = unsafe {
        libc::mount(
            c"cgroup".as_ptr(),
            dest.as_ptr(),
            c"cgroup".as_ptr(),
            0,
            controllers.as_ptr().cast(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Make every mount under `/` private, recursively. A child in a fresh mount
/// namespace calls this first so its bind and tmpfs mounts never propagate
/// back to the host.
pub fn rprivate_root() -> Result<(), Errno> {
    // SAFETY: constant arguments; source/fstype/data are ignored.
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Unmount `dest`. With `lazy`, uses `MNT_DETACH` so busy mounts detach
/// instead of failing with `EBUSY`.
pub fn umount(dest: &CStr, lazy: bool) -> Result<(), Errno> {
    let flags = if lazy { libc::MNT_DETACH } else { 0 };
    // SAFETY: dest is a valid CStr.
    let ret = unsafe { libc::umount2(dest.as_ptr(), flags) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_requires_privilege_or_valid_paths() {
        // Unprivileged with a nonexistent target: must fail, never panic.
        let err = bind(c"/nonexistent-src", c"/nonexistent-dest").unwrap_err();
        assert!(err == Errno::NOENT || err == Errno::PERM || err == Errno::ACCESS);
    }

    #[test]
    fn umount_nonexistent_fails() {
        assert!(umount(c"/nonexistent-mount-point", true).is_err());
    }
}
