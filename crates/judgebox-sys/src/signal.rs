//! Signal disposition and mask reset.
//!
//! A sandboxed child must not inherit the parent's handlers or blocked
//! signals: provisioning runs with every disposition at default and nothing
//! masked, and the exec'd program starts from a clean slate.

use rustix::io::Errno;

use crate::last_errno;

/// Reset every catchable signal to `SIG_DFL` and unblock all signals.
///
/// `SIGKILL` and `SIGSTOP` are skipped (the kernel rejects changing them).
/// Performs only direct syscalls, so it is safe between fork and exec.
pub fn reset_for_exec() -> Result<(), Errno> {
    for sig in 1..libc::SIGRTMAX() {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // SAFETY: SIG_DFL is always a valid disposition; failures for
        // unsupported signal numbers are ignored on purpose.
        unsafe { libc::signal(sig, libc::SIG_DFL) };
    }

    // SAFETY: set is fully initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) != 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}
