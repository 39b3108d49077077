//! Fork/exec choreography for confined children.
//!
//! [`Cgroup::spawn`] brings a child from `clone(2)` to `execve(2)` with
//! every limit in place before the first user instruction runs. The child
//! is created in fresh PID, mount, UTS, IPC and NET namespaces and walked
//! through four provisioning phases over the handshake channel:
//!
//! ```text
//! parent                                child
//! ------                                -----
//! clone() ────────────────────────────▶ blocks on channel
//! attach pid to cgroup
//! GO_BINDFS ──────────────────────────▶ rprivate /, bind mounts   ─▶ OK
//! GO_CHROOT ──────────────────────────▶ chroot + chdir /          ─▶ OK
//! GO_TMPFS ───────────────────────────▶ tmpfs mounts              ─▶ OK
//! GO_CREDS ───────────────────────────▶ gid, groups, uid,
//!                                       nice, rlimits             ─▶ OK
//! GO_EXEC ────────────────────────────▶ reset signals, execve
//! return pid
//! ```
//!
//! Any `FAIL` (or silence) makes the parent SIGKILL the child, drain the
//! channel, reap the corpse and report which stage broke. Cgroup state is
//! deliberately left as-is: the group may be reused, and teardown belongs
//! to [`Cgroup::destroy`].
//!
//! ## Fork/exec boundary
//!
//! Between clone and exec the child does only async-signal-safe work: raw
//! syscalls on pre-built data. Argv, envp, every mount path and the tmpfs
//! option strings are allocated in the parent and inherited across the
//! fork; the child never allocates or takes a lock.

use std::collections::BTreeMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::path::PathBuf;

use rustix::io::Errno;
use thiserror::Error;
use tracing::{debug, warn};

use judgebox_sys::{last_errno, mount, signal};

use crate::cgroup::{Cgroup, CgroupError};
use crate::channel::{self, msg, Channel, ParentEnd, Reply};
use crate::fs::{self, FsError};

/// Namespaces every sandboxed child gets, before any extra flags.
pub const BASE_CLONE_FLAGS: libc::c_int =
    libc::CLONE_NEWNS | libc::CLONE_NEWPID | libc::CLONE_NEWUTS | libc::CLONE_NEWIPC | libc::CLONE_NEWNET;

/// Stack for the cloned child. Provisioning runs a handful of syscalls
/// deep, but mount option strings and the libc resolver want headroom.
const CHILD_STACK_SIZE: usize = 256 * 1024;

/// Shell convention for "exec failed".
const EXEC_FAILED_EXIT: libc::c_int = 127;

/// Mode for tmpfs mounts requested through [`SpawnRequest::tmpfs`].
const TMPFS_MODE: u32 = 0o777;

const NICE_WARNING: &[u8] = b"judgebox: setpriority failed, continuing\n";

/// Provisioning phase a spawn failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bindfs,
    Chroot,
    Tmpfs,
    Credentials,
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Bindfs => "bind mounts",
            Stage::Chroot => "chroot",
            Stage::Tmpfs => "tmpfs mounts",
            Stage::Credentials => "credential drop",
            Stage::Exec => "exec release",
        })
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("argv must name an executable")]
    EmptyArgv,

    #[error("argv or environment contains a NUL byte")]
    BadString,

    #[error("mount path: {0}")]
    BadMountPath(#[from] FsError),

    #[error("handshake channel: {0}")]
    Channel(#[from] std::io::Error),

    #[error("clone: {0}")]
    Clone(Errno),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    /// The child reported a failure byte for this stage and exited.
    #[error("child failed during {0}")]
    ChildFailed(Stage),

    /// The child died without reporting; nothing survived it.
    #[error("child vanished during {0}")]
    ChildGone(Stage),

    #[error("handshake io during {stage}: {errno}")]
    Handshake { stage: Stage, errno: Errno },
}

/// Everything a confined child needs, fixed at build time.
///
/// Mount lists are applied in order. `bindfs` destinations are resolved
/// against the pre-chroot root, `tmpfs` destinations against the
/// post-chroot root. Credentials must be real (non-root) ids: a request
/// with `uid` or `gid` of 0 fails at the credential-drop phase.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Executable and arguments; `argv[0]` is the path passed to exec.
    pub argv: Vec<String>,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// Scheduling niceness; failure to apply is non-fatal.
    pub nice: libc::c_int,
    /// Extra namespace bits OR-ed into [`BASE_CLONE_FLAGS`].
    pub extra_clone_flags: libc::c_int,
    /// New root, entered after the bind mounts. `None` keeps the current
    /// root (tmpfs destinations then resolve in the original filesystem).
    pub chroot_path: Option<PathBuf>,
    /// `(dest, src)` read-only bind mounts, applied before chroot.
    pub bindfs: Vec<(PathBuf, PathBuf)>,
    /// `(dest, bytes)` tmpfs mounts, applied after chroot.
    pub tmpfs: Vec<(PathBuf, u64)>,
    /// Resource limits; each entry sets soft and hard to the same value.
    /// `RLIMIT_CORE` is forced to 0 unless explicitly present.
    pub rlimits: BTreeMap<libc::__rlimit_resource_t, libc::rlim_t>,
    /// Start from an empty environment instead of inheriting.
    pub reset_env: bool,
    /// `(name, value)` pairs set in the child environment, in order;
    /// overrides inherited names.
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(
        argv: impl IntoIterator<Item = impl Into<String>>,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            uid,
            gid,
            nice: 0,
            extra_clone_flags: 0,
            chroot_path: None,
            bindfs: Vec::new(),
            tmpfs: Vec::new(),
            rlimits: BTreeMap::new(),
            reset_env: false,
            env: Vec::new(),
        }
    }

    pub fn nice(mut self, nice: libc::c_int) -> Self {
        self.nice = nice;
        self
    }

    pub fn clone_flags(mut self, extra: libc::c_int) -> Self {
        self.extra_clone_flags |= extra;
        self
    }

    pub fn chroot(mut self, path: impl Into<PathBuf>) -> Self {
        self.chroot_path = Some(path.into());
        self
    }

    /// Bind `src` read-only at `dest` (pre-chroot path).
    pub fn bind(mut self, dest: impl Into<PathBuf>, src: impl Into<PathBuf>) -> Self {
        self.bindfs.push((dest.into(), src.into()));
        self
    }

    /// Mount a tmpfs capped at `bytes` at `dest` (post-chroot path).
    pub fn tmpfs(mut self, dest: impl Into<PathBuf>, bytes: u64) -> Self {
        self.tmpfs.push((dest.into(), bytes));
        self
    }

    pub fn rlimit(mut self, resource: libc::__rlimit_resource_t, value: libc::rlim_t) -> Self {
        self.rlimits.insert(resource, value);
        self
    }

    pub fn reset_env(mut self) -> Self {
        self.reset_env = true;
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

/// Pre-allocated, fork-inheritable form of a [`SpawnRequest`]. The child
/// only dereferences this; it never allocates.
struct ChildContext {
    child_fd: libc::c_int,
    parent_fd: libc::c_int,
    /// `(src, dest)` pairs, mount order preserved.
    bindfs: Vec<(CString, CString)>,
    chroot: Option<CString>,
    /// `(dest, data)` pairs with pre-rendered `size=,mode=` strings.
    tmpfs: Vec<(CString, CString)>,
    uid: libc::uid_t,
    gid: libc::gid_t,
    nice: libc::c_int,
    rlimits: Vec<(libc::__rlimit_resource_t, libc::rlim_t)>,
    exe: CString,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    // Backing storage the pointer arrays refer into.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
}

fn prepare(request: &SpawnRequest) -> Result<ChildContext, SpawnError> {
    if request.argv.is_empty() {
        return Err(SpawnError::EmptyArgv);
    }

    let argv: Vec<CString> = request
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| SpawnError::BadString)?;
    let envp = build_envp(request)?;

    let argv_ptrs = null_terminated(&argv);
    let envp_ptrs = null_terminated(&envp);

    let bindfs = request
        .bindfs
        .iter()
        .map(|(dest, src)| Ok((fs::path_to_cstring(src)?, fs::path_to_cstring(dest)?)))
        .collect::<Result<_, FsError>>()?;

    let tmpfs = request
        .tmpfs
        .iter()
        .map(|(dest, bytes)| Ok((fs::path_to_cstring(dest)?, fs::tmpfs_data(*bytes, TMPFS_MODE))))
        .collect::<Result<_, FsError>>()?;

    let chroot = request
        .chroot_path
        .as_deref()
        .map(fs::path_to_cstring)
        .transpose()?;

    let mut rlimits: Vec<(libc::__rlimit_resource_t, libc::rlim_t)> = request
        .rlimits
        .iter()
        .map(|(&resource, &value)| (resource, value))
        .collect();
    if !request.rlimits.contains_key(&libc::RLIMIT_CORE) {
        rlimits.push((libc::RLIMIT_CORE, 0));
    }

    Ok(ChildContext {
        child_fd: -1,
        parent_fd: -1,
        bindfs,
        chroot,
        tmpfs,
        uid: request.uid,
        gid: request.gid,
        nice: request.nice,
        rlimits,
        exe: argv[0].clone(),
        argv_ptrs,
        envp_ptrs,
        _argv: argv,
        _envp: envp,
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Final child environment: inherited (unless `reset_env`) with the
/// request's pairs applied in order, overriding by name.
fn build_envp(request: &SpawnRequest) -> Result<Vec<CString>, SpawnError> {
    let mut pairs: Vec<(String, String)> = if request.reset_env {
        Vec::new()
    } else {
        std::env::vars().collect()
    };

    for (name, value) in &request.env {
        match pairs.iter_mut().find(|(existing, _)| existing == name) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((name.clone(), value.clone())),
        }
    }

    pairs
        .into_iter()
        .map(|(name, value)| CString::new(format!("{name}={value}")))
        .collect::<Result<_, _>>()
        .map_err(|_| SpawnError::BadString)
}

impl Cgroup {
    /// Spawn `request.argv` confined to this cgroup and return its pid.
    ///
    /// The pid is attached to the group before the child performs any
    /// provisioning, so nothing the child does escapes accounting. On any
    /// provisioning failure the child is killed and reaped and the error
    /// names the stage; cgroup state (limits, mounts installed by earlier
    /// spawns) is left untouched for reuse or [`Cgroup::destroy`].
    ///
    /// The caller owns termination: `waitpid` on the returned pid.
    pub fn spawn(&self, request: &SpawnRequest) -> Result<libc::pid_t, SpawnError> {
        let mut ctx = prepare(request)?;
        let chan = Channel::new()?;
        ctx.child_fd = chan.child_fd();
        ctx.parent_fd = chan.parent_fd();

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        // SAFETY: stack_top stays within the allocation; clone without
        // CLONE_VM gives the child a copy-on-write snapshot, so ctx and the
        // stack remain valid for the child even after this frame returns.
        let pid = unsafe {
            let top = stack.as_mut_ptr().add(stack.len());
            let top = ((top as usize) & !0xf) as *mut c_void;
            libc::clone(
                child_main,
                top,
                BASE_CLONE_FLAGS | request.extra_clone_flags | libc::SIGCHLD,
                (&ctx as *const ChildContext as *mut ChildContext).cast(),
            )
        };
        if pid < 0 {
            return Err(SpawnError::Clone(last_errno()));
        }

        let parent = chan.into_parent();

        // The child blocks before its first step; get it under accounting
        // before releasing it into anything that consumes memory.
        if let Err(e) = self.attach(pid) {
            abort_child(&parent, pid, Stage::Bindfs);
            return Err(e.into());
        }

        for (go, stage) in [
            (msg::GO_BINDFS, Stage::Bindfs),
            (msg::GO_CHROOT, Stage::Chroot),
            (msg::GO_TMPFS, Stage::Tmpfs),
            (msg::GO_CREDS, Stage::Credentials),
        ] {
            drive_step(&parent, pid, go, stage)?;
        }

        if let Err(errno) = parent.send_go(msg::GO_EXEC) {
            abort_child(&parent, pid, Stage::Exec);
            return Err(SpawnError::Handshake {
                stage: Stage::Exec,
                errno,
            });
        }

        debug!(pid, "sandboxed child released to exec");
        Ok(pid)
    }
}

fn drive_step(
    parent: &ParentEnd,
    pid: libc::pid_t,
    go: u8,
    stage: Stage,
) -> Result<(), SpawnError> {
    if let Err(errno) = parent.send_go(go) {
        abort_child(parent, pid, stage);
        return Err(SpawnError::Handshake { stage, errno });
    }
    match parent.recv_reply() {
        Ok(Reply::Ok) => Ok(()),
        Ok(Reply::Fail) => {
            abort_child(parent, pid, stage);
            Err(SpawnError::ChildFailed(stage))
        }
        Ok(Reply::Gone) => {
            abort_child(parent, pid, stage);
            Err(SpawnError::ChildGone(stage))
        }
        Err(errno) => {
            abort_child(parent, pid, stage);
            Err(SpawnError::Handshake { stage, errno })
        }
    }
}

/// Kill, drain and reap a half-provisioned child. After this, no process
/// from the failed spawn remains.
fn abort_child(parent: &ParentEnd, pid: libc::pid_t, stage: Stage) {
    warn!(pid, %stage, "aborting sandboxed child");
    // SAFETY: signalling and reaping our own direct child.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    parent.drain();
    loop {
        // SAFETY: pid is our direct child; status is ignored.
        let ret = unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
        if ret >= 0 || last_errno() != Errno::INTR {
            break;
        }
    }
}

extern "C" fn child_main(arg: *mut c_void) -> libc::c_int {
    // SAFETY: the parent passed a valid ChildContext; this copy of the
    // address space owns it for the rest of the child's life.
    let ctx = unsafe { &*(arg as *const ChildContext) };
    child_run(ctx)
}

/// The child's side of the handshake. Raw syscalls on pre-built data
/// only - see the module doc's fork/exec boundary rules.
fn child_run(ctx: &ChildContext) -> libc::c_int {
    // SAFETY: closing the inherited copy of the parent's channel end.
    unsafe { libc::close(ctx.parent_fd) };
    let fd = ctx.child_fd;

    for (go, step) in [
        (msg::GO_BINDFS, apply_bindfs as fn(&ChildContext) -> bool),
        (msg::GO_CHROOT, apply_chroot),
        (msg::GO_TMPFS, apply_tmpfs),
        (msg::GO_CREDS, apply_credentials),
    ] {
        if !channel::child_await(fd, go) {
            return 1;
        }
        let ok = step(ctx);
        channel::child_reply(fd, ok);
        if !ok {
            return 1;
        }
    }

    if !channel::child_await(fd, msg::GO_EXEC) {
        return 1;
    }
    let _ = signal::reset_for_exec();

    // SAFETY: argv_ptrs and envp_ptrs are NULL-terminated arrays pointing
    // into CStrings owned by ctx.
    unsafe {
        libc::execve(
            ctx.exe.as_ptr(),
            ctx.argv_ptrs.as_ptr(),
            ctx.envp_ptrs.as_ptr(),
        );
    }
    // Still here: exec failed. Report and exit by the shell convention.
    channel::child_reply(fd, false);
    EXEC_FAILED_EXIT
}

/// S1: make the new mount namespace private, then apply the bind mounts
/// in request order against the original root.
fn apply_bindfs(ctx: &ChildContext) -> bool {
    if mount::rprivate_root().is_err() {
        return false;
    }
    for (src, dest) in &ctx.bindfs {
        if mount::bind(src, dest).is_err() || mount::remount_readonly(dest).is_err() {
            return false;
        }
    }
    true
}

/// S2: enter the new root, if one was requested.
fn apply_chroot(ctx: &ChildContext) -> bool {
    let Some(root) = &ctx.chroot else {
        return true;
    };
    // SAFETY: root is a valid CStr owned by ctx.
    unsafe { libc::chroot(root.as_ptr()) == 0 && libc::chdir(c"/".as_ptr()) == 0 }
}

/// S3: tmpfs mounts in request order against the (possibly new) root.
fn apply_tmpfs(ctx: &ChildContext) -> bool {
    ctx.tmpfs
        .iter()
        .all(|(dest, data)| mount::tmpfs(dest, data).is_ok())
}

/// S4: drop to the requested ids (refusing root), then niceness and
/// rlimits. Order is load-bearing: gid while still privileged, then the
/// supplementary groups, then uid - after which none of it could be undone.
fn apply_credentials(ctx: &ChildContext) -> bool {
    if ctx.uid == 0 || ctx.gid == 0 {
        return false;
    }

    // SAFETY: plain syscalls on value arguments.
    unsafe {
        if libc::setresgid(ctx.gid, ctx.gid, ctx.gid) != 0 {
            return false;
        }
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return false;
        }
        if libc::setresuid(ctx.uid, ctx.uid, ctx.uid) != 0 {
            return false;
        }
        if libc::setpriority(libc::PRIO_PROCESS, 0, ctx.nice) != 0 {
            libc::write(2, NICE_WARNING.as_ptr().cast(), NICE_WARNING.len());
        }
    }

    for &(resource, value) in &ctx.rlimits {
        let rlim = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: rlim is a valid struct; resource is a kernel constant.
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return false;
        }
    }
    true
}
