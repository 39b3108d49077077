//! Cgroup v1 lifecycle management.
//!
//! A [`Cgroup`] wraps one directory under the memory/cpuacct hierarchy:
//! create it, program limits through control files, attach tasks, read
//! usage back, kill everything inside, and remove it. The hierarchy mount
//! point itself is discovered once per process (and optionally mounted)
//! by [`base_path`].
//!
//! ## Control files used
//!
//! | property | purpose |
//! |----------|---------|
//! | `tasks` | attach pids, enumerate for killall |
//! | `memory.limit_in_bytes` | memory limit (`-1` = unlimited) |
//! | `memory.memsw.limit_in_bytes` | memory+swap limit, when available |
//! | `memory.max_usage_in_bytes` | peak memory, reset to re-arm |
//! | `memory.memsw.max_usage_in_bytes` | peak memory+swap, when available |
//! | `cpuacct.usage` | cumulative cpu time in nanoseconds |
//! | `devices.deny` / `devices.allow` | device whitelist |
//! | `cpuset.cpus` / `cpuset.mems` | inherited before tasks attach |

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::fs::{self, FsError};

/// Hierarchy mounted on demand when none carries the controllers we need.
const PRIVATE_MOUNT_POINTS: [&str; 2] = ["/sys/fs/cgroup/judgebox", "/cgroup/judgebox"];

/// Controllers a usable hierarchy must carry.
const REQUIRED_CONTROLLERS: [&str; 2] = ["memory", "cpuacct"];

/// Controller list used when mounting a private hierarchy.
const MOUNT_CONTROLLERS: &std::ffi::CStr = c"memory,cpuacct,devices";

/// Pseudo-devices re-allowed after `devices.deny = a`: null, zero, full,
/// random, urandom.
const DEVICE_WHITELIST: [&str; 5] = [
    "c 1:3 rwm",
    "c 1:5 rwm",
    "c 1:7 rwm",
    "c 1:8 rwm",
    "c 1:9 rwm",
];

/// Kill/re-read passes before `killall` reports a stall.
const KILL_PASSES: u32 = 100;

/// rmdir attempts before `destroy` gives up on a busy directory.
const RMDIR_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum CgroupError {
    /// No mounted hierarchy carries the memory and cpuacct controllers,
    /// and mounting one was not requested.
    #[error("no cgroup hierarchy with memory and cpuacct controllers is mounted")]
    ControllerNotMounted,

    /// Mounting or preparing the private hierarchy failed. Fatal: nothing
    /// can be confined without it.
    #[error("cgroup hierarchy setup: {0}")]
    Setup(#[from] FsError),

    /// The private hierarchy mount itself was rejected by the kernel.
    #[error("mount cgroup hierarchy at {path}: {errno}")]
    Mount {
        path: PathBuf,
        errno: rustix::io::Errno,
    },

    /// Group names map to a single directory component.
    #[error("invalid cgroup name: {0:?}")]
    BadName(String),

    /// A control-file write failed; the property names the file.
    #[error("control file {property}: {source}")]
    ControlFile { property: String, source: FsError },

    /// Attaching a pid to `tasks` failed.
    #[error("attach pid {pid}: {source}")]
    Attach { pid: libc::pid_t, source: FsError },

    /// `killall` hit its pass bound with tasks still alive.
    #[error("killall stalled with {remaining} task(s) still present")]
    KillStalled { remaining: usize },

    /// The cgroup directory survived every rmdir attempt.
    #[error("destroy: directory still busy: {path}")]
    DestroyBusy { path: PathBuf },
}

static BASE_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Locate the cgroup v1 hierarchy carrying the memory and cpuacct
/// controllers: the first matching mount in the kernel mount table.
///
/// With `create_on_need`, a missing hierarchy is mounted privately at a
/// fixed path instead. The discovered path is memoised for the life of the
/// process; only failed probes are retried.
pub fn base_path(create_on_need: bool) -> Result<&'static Path, CgroupError> {
    if let Some(path) = BASE_PATH.get() {
        return Ok(path.as_path());
    }

    let found = fs::mounts()?
        .into_iter()
        .find(|m| m.fstype == "cgroup" && REQUIRED_CONTROLLERS.iter().all(|c| m.has_option(c)))
        .map(|m| PathBuf::from(m.target));

    let path = match found {
        Some(path) => {
            debug!(path = %path.display(), "found cgroup hierarchy");
            path
        }
        None if create_on_need => mount_private_hierarchy()?,
        None => return Err(CgroupError::ControllerNotMounted),
    };

    Ok(BASE_PATH.get_or_init(|| path).as_path())
}

fn mount_private_hierarchy() -> Result<PathBuf, CgroupError> {
    let target = if Path::new("/sys/fs/cgroup").is_dir() {
        PRIVATE_MOUNT_POINTS[0]
    } else {
        PRIVATE_MOUNT_POINTS[1]
    };
    let path = Path::new(target);

    fs::mkdir_p(path, 0o755)?;
    let target_c = fs::path_to_cstring(path)?;
    judgebox_sys::mount::cgroup(&target_c, MOUNT_CONTROLLERS).map_err(|errno| {
        CgroupError::Mount {
            path: path.to_path_buf(),
            errno,
        }
    })?;

    debug!(path = target, "mounted private cgroup hierarchy");
    Ok(path.to_path_buf())
}

/// Handle to one cgroup directory.
///
/// The directory exists for the handle's lifetime unless [`destroy`] is
/// called; `destroy` consumes the handle, so no operation can observe a
/// removed group. The handle does not own the processes inside - attached
/// pids come and go independently.
///
/// [`destroy`]: Cgroup::destroy
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create (or reuse) the group `base/name`.
    ///
    /// Idempotent: an existing directory is success, including one created
    /// concurrently by another process. When the hierarchy co-mounts the
    /// cpuset controller, `cpuset.cpus` and `cpuset.mems` are inherited
    /// from the parent so tasks can attach.
    pub fn create(name: &str) -> Result<Self, CgroupError> {
        let cgroup = Self {
            path: Self::path_from_name(name)?,
        };

        // mkdir_p treats an existing directory as success, so creation
        // racing with another process is not fatal.
        if !fs::is_dir(&cgroup.path) {
            fs::mkdir_p(&cgroup.path, 0o755)?;
        }

        for property in ["cpuset.cpus", "cpuset.mems"] {
            if cgroup.path.join(property).exists() {
                cgroup.inherit(property)?;
            }
        }

        debug!(name, path = %cgroup.path.display(), "cgroup ready");
        Ok(cgroup)
    }

    /// Whether the group `name` currently exists.
    pub fn exists(name: &str) -> bool {
        Self::path_from_name(name).is_ok_and(|p| fs::is_dir(&p))
    }

    /// Absolute directory for the group `name` under the discovered
    /// hierarchy.
    pub fn path_from_name(name: &str) -> Result<PathBuf, CgroupError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(CgroupError::BadName(name.to_string()));
        }
        Ok(base_path(true)?.join(name))
    }

    /// The group's directory.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the underlying directory still exists. Another process may
    /// remove it at any time; operations after that fail with the error of
    /// the control file they touch.
    pub fn valid(&self) -> bool {
        fs::is_dir(&self.path)
    }

    /// Write a control property.
    pub fn set(&self, property: &str, value: &str) -> Result<(), CgroupError> {
        fs::write(&self.path.join(property), value).map_err(|source| CgroupError::ControlFile {
            property: property.to_string(),
            source,
        })
    }

    /// Read a control property, up to `max_len` bytes. Empty on failure.
    pub fn get(&self, property: &str, max_len: usize) -> String {
        fs::read(&self.path.join(property), max_len)
    }

    /// Copy a property's value from the parent group into this one.
    ///
    /// `cpuset.cpus` and `cpuset.mems` start empty in a fresh group and
    /// must be populated this way before any task can attach.
    pub fn inherit(&self, property: &str) -> Result<(), CgroupError> {
        let parent = self.path.parent().unwrap_or(Path::new("/"));
        let value = fs::read(&parent.join(property), 255);
        let value = value.trim_end_matches('\n');
        self.set(property, value)
    }

    /// Attach a process to this group.
    pub fn attach(&self, pid: libc::pid_t) -> Result<(), CgroupError> {
        fs::write(&self.path.join("tasks"), &pid.to_string()).map_err(|source| {
            CgroupError::Attach { pid, source }
        })
    }

    /// Set the memory limit in bytes; `bytes <= 0` lifts the limit.
    ///
    /// When swap accounting is available the memory+swap limit is set to
    /// the same value, so swapping cannot hide usage from the cap. Fails
    /// if the kernel rejects the write (e.g. a limit below current usage).
    pub fn set_memory_limit(&self, bytes: i64) -> Result<(), CgroupError> {
        let value = if bytes <= 0 {
            "-1".to_string()
        } else {
            bytes.to_string()
        };

        if !self.path.join("memory.memsw.limit_in_bytes").exists() {
            return self.set("memory.limit_in_bytes", &value);
        }

        // The kernel enforces limit_in_bytes <= memsw.limit_in_bytes, so
        // write order depends on the direction of the change relative to
        // the current limit: widen memsw before raising (or lifting) the
        // memory limit, shrink it only after lowering the memory limit.
        let raising = bytes <= 0 || bytes as u64 > self.memory_limit();
        if raising {
            self.set("memory.memsw.limit_in_bytes", &value)?;
            self.set("memory.limit_in_bytes", &value)
        } else {
            self.set("memory.limit_in_bytes", &value)?;
            self.set("memory.memsw.limit_in_bytes", &value)
        }
    }

    /// Peak memory usage in bytes: memory+swap when the kernel accounts
    /// swap, plain memory otherwise. 0 when unreadable.
    pub fn memory_usage(&self) -> u64 {
        let memsw = self.get("memory.memsw.max_usage_in_bytes", 64);
        let raw = if memsw.is_empty() {
            self.get("memory.max_usage_in_bytes", 64)
        } else {
            memsw
        };
        raw.trim().parse().unwrap_or(0)
    }

    /// Current memory limit in bytes. 0 when unreadable.
    pub fn memory_limit(&self) -> u64 {
        self.get("memory.limit_in_bytes", 64).trim().parse().unwrap_or(0)
    }

    /// Cumulative cpu time of the group in seconds. 0.0 when unreadable.
    pub fn cpu_usage(&self) -> f64 {
        let nanos: u64 = self.get("cpuacct.usage", 64).trim().parse().unwrap_or(0);
        nanos as f64 / 1e9
    }

    /// Re-arm the usage counters: peak memory and cpu time back to zero.
    ///
    /// Both writes are attempted even if the first fails; the first
    /// failure is what gets reported.
    pub fn reset_usages(&self) -> Result<(), CgroupError> {
        let memory = self.set("memory.max_usage_in_bytes", "0");
        let cpu = self.set("cpuacct.usage", "0");
        memory.and(cpu)
    }

    /// Restrict the group to the five safe pseudo-devices: deny everything,
    /// then allow null, zero, full, random and urandom. Deny must come
    /// first - the allows punch holes in it.
    pub fn limit_devices(&self) -> Result<(), CgroupError> {
        self.set("devices.deny", "a")?;
        for device in DEVICE_WHITELIST {
            self.set("devices.allow", device)?;
        }
        Ok(())
    }

    /// SIGKILL every task in the group until `tasks` stays empty, and
    /// return the number of kills issued.
    ///
    /// Children re-parented to init when their parent dies still show up
    /// here, so the file is re-read after every pass. Bounded: if the
    /// group is not empty after a fixed number of passes, the stall is
    /// surfaced instead of looping forever.
    pub fn killall(&self) -> Result<u64, CgroupError> {
        let mut kills = 0u64;

        for _ in 0..KILL_PASSES {
            let tasks = self.get("tasks", 1 << 20);
            let pids: Vec<libc::pid_t> = tasks
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect();

            if pids.is_empty() {
                return Ok(kills);
            }

            for pid in pids {
                // SAFETY: sending a signal is always safe; a stale pid is
                // reported by the return value and ignored.
                if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
                    kills += 1;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let remaining = self.get("tasks", 1 << 20).lines().count();
        warn!(path = %self.path.display(), remaining, "killall stalled");
        Err(CgroupError::KillStalled { remaining })
    }

    /// Kill every task, then remove the group directory.
    ///
    /// Consumes the handle: after `destroy` there is nothing left to call.
    /// Mounts installed by a spawn live outside the group directory and
    /// are never unmounted here - that is the caller's contract.
    pub fn destroy(self) -> Result<(), CgroupError> {
        self.killall()?;

        for _ in 0..RMDIR_RETRIES {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "cgroup destroyed");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                // Exiting tasks release the directory shortly after SIGKILL.
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }

        warn!(path = %self.path.display(), "cgroup directory still busy");
        Err(CgroupError::DestroyBusy { path: self.path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_whitelist_literals() {
        // null, zero, full, random, urandom by character major:minor.
        assert_eq!(
            DEVICE_WHITELIST,
            ["c 1:3 rwm", "c 1:5 rwm", "c 1:7 rwm", "c 1:8 rwm", "c 1:9 rwm"]
        );
    }

    #[test]
    fn bad_names_rejected() {
        for name in ["", "a/b", ".", ".."] {
            assert!(matches!(
                Cgroup::path_from_name(name),
                Err(CgroupError::BadName(_))
            ));
        }
    }

    #[test]
    fn usage_parsers_default_to_zero() {
        let group = Cgroup {
            path: PathBuf::from("/nonexistent/judgebox-test"),
        };
        assert_eq!(group.memory_usage(), 0);
        assert_eq!(group.memory_limit(), 0);
        assert_eq!(group.cpu_usage(), 0.0);
        assert!(!group.valid());
        assert_eq!(group.get("tasks", 255), "");
    }
}
