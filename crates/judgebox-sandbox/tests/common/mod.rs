//! Shared helpers for the root-only cgroup test suites.

#![allow(dead_code)]

/// Unprivileged uid/gid the sandboxed children drop to.
pub const SANDBOX_UID: libc::uid_t = 1000;
pub const SANDBOX_GID: libc::gid_t = 1000;

/// Whether this test process can actually drive cgroups and namespaces.
/// Suites bail out early (they are `#[ignore]`d anyway) when run as a
/// regular user.
pub fn is_root() -> bool {
    // SAFETY: geteuid is always safe.
    unsafe { libc::geteuid() == 0 }
}

/// Per-run unique cgroup name, so parallel or aborted runs never collide.
pub fn unique(tag: &str) -> String {
    format!("judgebox-test-{}-{tag}", std::process::id())
}

/// Blocking waitpid. Returns `(exit_code, signal)`, at most one of them set.
pub fn wait_status(pid: libc::pid_t) -> (Option<i32>, Option<i32>) {
    let mut status = 0;
    // SAFETY: pid is a direct child of the test process.
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert!(ret == pid, "waitpid({pid}) returned {ret}");

    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    }
}

/// Spawn must have reaped everything; a lingering child here means a
/// failed spawn leaked a process.
pub fn assert_no_children() {
    // SAFETY: WNOHANG wait never blocks; ECHILD is the expected outcome.
    let ret = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
    assert!(ret <= 0, "unexpected live child {ret}");
}
